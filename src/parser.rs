//! Deserialize responses from the bytecode protocol.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    multi::many_m_n,
    number::complete::{be_i16, be_i32, be_u16, be_u8},
};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;

type ParseError = nom::Err<nom::error::Error<NomBytes>>;

fn failure(input: NomBytes, kind: nom::error::ErrorKind) -> ParseError {
    nom::Err::Failure(nom::error::Error::new(input, kind))
}

/// Convert bytes to a validated UTF-8 string.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, ParseError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| {
            failure(
                NomBytes::from(bytes.as_ref()),
                nom::error::ErrorKind::Verify,
            )
        })
}

/// Convert optional bytes to a validated UTF-8 string.
pub fn bytes_to_string_opt(bytes: Option<Bytes>) -> Result<Option<String>, ParseError> {
    match bytes {
        Some(b) => bytes_to_string(&b).map(Some),
        None => Ok(None),
    }
}

pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u16(s)?;
    let (s, string) = take(length)(s)?;
    Ok((s, string.into_bytes()))
}

/// A non-nullable STRING decoded as UTF-8.
pub fn parse_utf8(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, raw) = parse_string(s)?;
    Ok((s, bytes_to_string(&raw)?))
}

pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i16(s)?;

    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(failure(s, nom::error::ErrorKind::TooLarge));
    }

    let (s, string) = take(length as u16)(s)?;
    Ok((s, Some(string.into_bytes())))
}

/// A NULLABLE_STRING decoded as UTF-8.
pub fn parse_nullable_utf8(s: NomBytes) -> IResult<NomBytes, Option<String>> {
    let (s, raw) = parse_nullable_string(s)?;
    Ok((s, bytes_to_string_opt(raw)?))
}

/// BYTES / NULLABLE_BYTES with an i32 length prefix. Null decodes as `None`.
pub fn parse_nullable_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i32(s)?;
    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(failure(s, nom::error::ErrorKind::TooLarge));
    }
    let (s, data) = take(length as usize)(s)?;
    Ok((s, Some(data.into_bytes())))
}

/// BYTES with an i32 length prefix. Null decodes as empty.
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, data) = parse_nullable_bytes(s)?;
    Ok((s, data.unwrap_or_default()))
}

pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: nom::error::ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let i = input.clone();
        let (i, length) = be_i32(i)?;

        // Null array
        if length == -1 {
            return Ok((i, vec![]));
        }

        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(
                i,
                nom::error::ErrorKind::TooLarge,
            )));
        }

        many_m_n(length as usize, length as usize, f)(i)
    }
}

/// Parse a zigzag varlong (record fields in RecordBatch v2).
pub fn parse_varlong(s: NomBytes) -> IResult<NomBytes, i64> {
    let mut raw: u64 = 0;
    let mut shift = 0;
    let mut remaining = s;

    loop {
        let (s, b) = be_u8(remaining)?;
        remaining = s;

        raw |= ((b & 0x7F) as u64) << shift;
        if (b & 0x80) == 0 {
            break;
        }

        shift += 7;
        if shift > 63 {
            return Err(failure(remaining, nom::error::ErrorKind::TooLarge));
        }
    }

    Ok((remaining, ((raw >> 1) as i64) ^ -((raw & 1) as i64)))
}

/// Parse a zigzag varint.
pub fn parse_varint(s: NomBytes) -> IResult<NomBytes, i32> {
    let (rest, value) = parse_varlong(s.clone())?;
    let value =
        i32::try_from(value).map_err(|_| failure(s, nom::error::ErrorKind::TooLarge))?;
    Ok((rest, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{encode_varint, encode_varlong};
    use nom::number::complete::be_i32;

    fn input(data: Vec<u8>) -> NomBytes {
        NomBytes::new(Bytes::from(data))
    }

    #[test]
    fn test_bytes_to_string_invalid_utf8() {
        let bytes = Bytes::from(vec![0xff, 0xfe]);
        assert!(bytes_to_string(&bytes).is_err());
    }

    #[test]
    fn test_parse_utf8_leaves_remainder() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_be_bytes());
        data.extend_from_slice(b"hello");
        data.extend_from_slice(b"extra");

        let (remaining, parsed) = parse_utf8(input(data)).unwrap();
        assert_eq!(parsed, "hello");
        assert_eq!(remaining.into_bytes(), Bytes::from("extra"));
    }

    #[test]
    fn test_parse_nullable_string_null() {
        let (_, parsed) = parse_nullable_string(input((-1i16).to_be_bytes().to_vec())).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_parse_nullable_string_invalid_length() {
        assert!(parse_nullable_string(input((-2i16).to_be_bytes().to_vec())).is_err());
    }

    #[test]
    fn test_parse_bytes_null_is_empty() {
        let (_, parsed) = parse_bytes(input((-1i32).to_be_bytes().to_vec())).unwrap();
        assert!(parsed.is_empty());
        let (_, parsed) =
            parse_nullable_bytes(input((-1i32).to_be_bytes().to_vec())).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_array_null_and_oversized() {
        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let (_, parsed) = parser(input((-1i32).to_be_bytes().to_vec())).unwrap();
        assert!(parsed.is_empty());

        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let too_big = (MAX_PROTOCOL_ARRAY_SIZE + 1).to_be_bytes().to_vec();
        assert!(parser(input(too_big)).is_err());
    }

    #[test]
    fn test_parse_varint_matches_encoder() {
        for value in [0i32, 1, -1, 63, -64, 64, 300, i32::MAX, i32::MIN] {
            let mut buf = Vec::new();
            encode_varint(&mut buf, value);
            let (rest, parsed) = parse_varint(input(buf)).unwrap();
            assert_eq!(parsed, value);
            assert!(rest.into_bytes().is_empty());
        }
    }

    #[test]
    fn test_parse_varint_rejects_out_of_range() {
        let mut buf = Vec::new();
        encode_varlong(&mut buf, i64::from(i32::MAX) + 1);
        assert!(parse_varint(input(buf)).is_err());
    }

    #[test]
    fn test_parse_varlong_truncated() {
        assert!(parse_varlong(input(vec![0x80])).is_err());
    }
}
