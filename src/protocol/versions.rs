//! ApiVersions v0.

use bytes::BufMut;
use nom::{IResult, number::complete::be_i16};
use nombytes::NomBytes;

use super::ApiKey;
use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};
use crate::parser::parse_array;

/// ApiVersions v0 has an empty body.
#[derive(Debug, Clone, Default)]
pub struct ApiVersionsRequest;

impl ToByte for ApiVersionsRequest {
    fn encode<W: BufMut>(&self, _buffer: &mut W) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiVersionsResponse {
    pub error_code: KafkaCode,
    pub api_keys: Vec<ApiVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

impl ApiVersionsResponse {
    /// Whether the broker accepts `version` of `key`.
    pub fn supports(&self, key: ApiKey, version: i16) -> bool {
        let key = i16::from(key);
        self.api_keys
            .iter()
            .any(|v| v.api_key == key && (v.min_version..=v.max_version).contains(&version))
    }

    /// The pinned client versions the broker does not support.
    pub fn unsupported(&self) -> Vec<ApiKey> {
        ApiKey::CLIENT_APIS
            .iter()
            .copied()
            .filter(|&key| !self.supports(key, key.client_version()))
            .collect()
    }
}

fn parse_api_version(s: NomBytes) -> IResult<NomBytes, ApiVersion> {
    let (s, api_key) = be_i16(s)?;
    let (s, min_version) = be_i16(s)?;
    let (s, max_version) = be_i16(s)?;
    Ok((
        s,
        ApiVersion {
            api_key,
            min_version,
            max_version,
        },
    ))
}

pub fn parse_api_versions_response(s: NomBytes) -> IResult<NomBytes, ApiVersionsResponse> {
    let (s, error_code) = be_i16(s)?;
    let (s, api_keys) = parse_array(parse_api_version)(s)?;
    Ok((
        s,
        ApiVersionsResponse {
            error_code: KafkaCode::from_wire(error_code),
            api_keys,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_and_unsupported() {
        let mut response = ApiVersionsResponse {
            error_code: KafkaCode::None,
            api_keys: ApiKey::CLIENT_APIS
                .iter()
                .map(|&key| ApiVersion {
                    api_key: key.into(),
                    min_version: 0,
                    max_version: 7,
                })
                .collect(),
        };
        assert!(response.supports(ApiKey::Fetch, 4));
        assert!(!response.supports(ApiKey::Fetch, 8));
        assert!(response.unsupported().is_empty());

        response.api_keys.retain(|v| v.api_key != i16::from(ApiKey::Produce));
        assert_eq!(response.unsupported(), vec![ApiKey::Produce]);
    }
}
