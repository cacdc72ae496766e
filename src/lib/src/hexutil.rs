use crate::error::AttestError;

/// Decode a hex string into a fixed size array, naming the field on length errors.
pub(crate) fn decode_array<const N: usize>(
    s: &str,
    what: &'static str,
) -> Result<[u8; N], AttestError> {
    let bytes = hex::decode(s)?;
    to_array(&bytes, what)
}

pub(crate) fn to_array<const N: usize>(
    bytes: &[u8],
    what: &'static str,
) -> Result<[u8; N], AttestError> {
    bytes.try_into().map_err(|_| AttestError::WrongLength {
        what,
        expected: N,
        got: bytes.len(),
    })
}
