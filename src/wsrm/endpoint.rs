use std::fmt::{Debug, Display, Formatter};


/// WS-Addressing 1.0 anonymous address: replies go on the back channel of the request
pub const WSA_ANONYMOUS: &str = "http://www.w3.org/2005/08/addressing/anonymous";
/// anonymous address of the 2004/08 WS-Addressing submission, used with WS-RM 1.0
pub const WSA_SUBMISSION_ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
/// prefix of WS-MakeConnection anonymous addresses. An endpoint with such an address is not
///  reachable at all - messages for it wait until the endpoint polls for them
pub const RM_ANONYMOUS_PREFIX: &str = "http://docs.oasis-open.org/ws-rx/wsmc/200702/anonymous?id=";


/// An endpoint address as it appears in AcksTo, ReplyTo, To and Offer/Endpoint elements.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointAddr(String);

impl EndpointAddr {
    pub fn new(address: impl Into<String>) -> EndpointAddr {
        EndpointAddr(address.into())
    }

    pub fn anonymous() -> EndpointAddr {
        EndpointAddr(WSA_ANONYMOUS.to_string())
    }

    /// a fresh RM anonymous address, unique per polling endpoint
    pub fn new_rm_anonymous() -> EndpointAddr {
        EndpointAddr(format!("{}{}", RM_ANONYMOUS_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// true for both WS-Addressing flavours of 'anonymous' and for RM anonymous addresses: there
    ///  is no way to open a connection to this endpoint
    pub fn is_anonymous(&self) -> bool {
        self.0 == WSA_ANONYMOUS || self.0 == WSA_SUBMISSION_ANONYMOUS || self.is_rm_anonymous()
    }

    /// true if messages for this endpoint can only be delivered in reply to a MakeConnection poll
    pub fn is_rm_anonymous(&self) -> bool {
        self.0.starts_with(RM_ANONYMOUS_PREFIX)
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Debug for EndpointAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl Display for EndpointAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointAddr {
    fn from(value: &str) -> Self {
        EndpointAddr::new(value)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::wsa(WSA_ANONYMOUS, true, false)]
    #[case::submission(WSA_SUBMISSION_ANONYMOUS, true, false)]
    #[case::rm_anonymous("http://docs.oasis-open.org/ws-rx/wsmc/200702/anonymous?id=abc", true, true)]
    #[case::regular("http://localhost:8080/service", false, false)]
    #[case::almost("http://www.w3.org/2005/08/addressing/anonymous2", false, false)]
    fn test_anonymous(#[case] address: &str, #[case] expected_anonymous: bool, #[case] expected_rm_anonymous: bool) {
        let addr = EndpointAddr::new(address);
        assert_eq!(addr.is_anonymous(), expected_anonymous);
        assert_eq!(addr.is_rm_anonymous(), expected_rm_anonymous);
    }

    #[test]
    fn test_new_rm_anonymous_is_unique() {
        let a = EndpointAddr::new_rm_anonymous();
        let b = EndpointAddr::new_rm_anonymous();
        assert!(a.is_rm_anonymous());
        assert_ne!(a, b);
    }
}
