/// RTCP feedback mechanism negotiated for a payload type, i.e. one
/// `a=rtcp-fb:<pt> <typ> <parameter>` line.
///
/// RFC 8888 feedback is negotiated as `typ="ack"`, `parameter="ccfb"`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCPFeedback {
    /// Feedback type, e.g. "ack", "nack", "transport-cc"
    pub typ: String,
    /// Type specific parameter, e.g. "ccfb" or "pli"
    pub parameter: String,
}

/// Stream context passed to interceptor bind/unbind callbacks.
///
/// Used by `Interceptor::bind_local_stream()`, `Interceptor::unbind_local_stream()`,
/// `Interceptor::bind_remote_stream()`, and `Interceptor::unbind_remote_stream()`.
#[derive(Default, Debug, Clone)]
pub struct StreamInfo {
    /// Synchronization Source identifier (SSRC) of the stream
    pub ssrc: u32,
    /// RTCP feedback mechanisms negotiated for this stream
    pub rtcp_feedback: Vec<RTCPFeedback>,
}
