//! Authentication exchange for fresh connections.
//!
//! When a cluster is configured with credentials, every newly opened
//! connection authenticates before it carries commands. The exchange is a
//! single admin frame (proto type 2) each way:
//!
//! ```text
//! command(1) | result_code(1) | field_count(2) | fields...
//! ```
//!
//! The client sends a USER field and a CREDENTIAL field holding the SHA-1 of
//! the password; the server answers with the result code in byte 1 of the
//! body. Code 0 means the connection is authenticated; anything else is a
//! server error and the connection must not be used.

use sha1::{Digest, Sha1};

use crate::error::{HiveError, Result};
use crate::protocol::{
    admin_field, parse_proto_header, proto_header, ResultCode, ADMIN_AUTHENTICATE,
    ADMIN_HEADER_SIZE, MSG_TYPE_ADMIN, PROTO_HEADER_SIZE,
};
use crate::transport::AsyncConnection;

/// Hashed form of a password as carried in the CREDENTIAL field.
pub fn hash_password(password: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Runs the authentication exchange on a fresh connection.
pub async fn authenticate(
    conn: &mut AsyncConnection,
    user: &str,
    password: &str,
) -> Result<()> {
    let credential = hash_password(password);

    let mut body = Vec::with_capacity(ADMIN_HEADER_SIZE + 10 + user.len() + credential.len());
    body.push(ADMIN_AUTHENTICATE);
    body.push(0); // result code, unused in requests
    body.extend_from_slice(&2u16.to_be_bytes());
    write_admin_field(&mut body, admin_field::USER, user.as_bytes());
    write_admin_field(&mut body, admin_field::CREDENTIAL, &credential);

    let mut msg = Vec::with_capacity(PROTO_HEADER_SIZE + body.len());
    msg.extend_from_slice(&proto_header(MSG_TYPE_ADMIN, body.len() as u64));
    msg.extend_from_slice(&body);
    conn.send_all(&msg).await?;

    let mut header = [0u8; PROTO_HEADER_SIZE];
    conn.recv_exact(&mut header).await?;
    let (_, msg_type, body_len) = parse_proto_header(&header)?;
    if msg_type != MSG_TYPE_ADMIN || (body_len as usize) < ADMIN_HEADER_SIZE {
        return Err(HiveError::Parse(format!(
            "malformed authentication response: type {}, {} bytes",
            msg_type, body_len
        )));
    }
    let mut response = vec![0u8; body_len as usize];
    conn.recv_exact(&mut response).await?;

    match ResultCode::from_u8(response[1]) {
        ResultCode::Ok => Ok(()),
        code => {
            tracing::warn!(user = user, code = %code, "authentication refused");
            Err(HiveError::ServerError(code))
        }
    }
}

fn write_admin_field(out: &mut Vec<u8>, field_type: u8, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    out.push(field_type);
    out.extend_from_slice(payload);
}
