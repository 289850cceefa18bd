// get_padding_size returns the number of bytes needed to pad `len` to a
// multiple of four
pub(crate) fn get_padding_size(len: usize) -> usize {
    if len % 4 == 0 { 0 } else { 4 - (len % 4) }
}
