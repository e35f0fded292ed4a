//! Thin seam over the external LDAP BER codec.
//!
//! The ASN.1/BER encoding of message *bodies* is someone else's problem —
//! here, the `ldap3_proto` crate, the same protocol library the reference
//! LDAP server this crate's architecture is grounded on builds against. This
//! module isolates that dependency's exact surface behind two functions
//! (`decode_message`, `encode_message`) so the rest of the crate only ever
//! deals with the re-exported `LdapMsg` / `LdapOp` types.

use bytes::Bytes;

pub use ldap3_proto::{LdapMsg, LdapOp, LdapResult, LdapResultCode};

use crate::error::{Error, Result};

/// OID of the unsolicited Notice of Disconnection extended response.
pub const OID_NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";

/// OID of the StartTLS extended request.
pub const OID_START_TLS: &str = "1.3.6.1.4.1.1466.20037";

/// Message id reserved for unsolicited server notifications.
pub const UNSOLICITED_MESSAGE_ID: i32 = 0;

/// Decode one complete, already-framed message body into a typed `LdapMsg`.
///
/// `bytes` is exactly the span `frame::scan` reported as complete; this
/// function never needs to look for a message boundary itself.
pub(crate) fn decode_message(bytes: Bytes) -> Result<LdapMsg> {
    LdapMsg::try_from(bytes).map_err(|_| Error::Decode("malformed LDAP message body".into()))
}

/// Encode a complete message (already stamped with its message id) to wire
/// bytes.
pub(crate) fn encode_message(msg: LdapMsg) -> Result<Vec<u8>> {
    Vec::<u8>::try_from(msg).map_err(|_| Error::Encode("LDAP message encode failed".into()))
}

/// Build the unsolicited Notice of Disconnection message sent just before a
/// connection is torn down on server shutdown.
pub(crate) fn notice_of_disconnection() -> LdapMsg {
    LdapMsg::new(
        UNSOLICITED_MESSAGE_ID,
        LdapOp::ExtendedResponse(ldap3_proto::LdapExtendedResponse {
            res: LdapResult {
                code: LdapResultCode::UnwillingToPerform,
                matcheddn: String::new(),
                message: "server is about to stop".to_string(),
                referral: Vec::new(),
            },
            name: Some(OID_NOTICE_OF_DISCONNECTION.to_string()),
            value: None,
        }),
    )
}

/// `true` if `op` is the StartTLS extended request.
pub(crate) fn is_start_tls(op: &LdapOp) -> bool {
    matches!(op, LdapOp::ExtendedRequest(req) if req.name == OID_START_TLS)
}
