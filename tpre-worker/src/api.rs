//! REST API of the worker node.

use axum::response::IntoResponse as _;
use axum_extra::headers::{self, Header};
use http::HeaderValue;

use crate::api::errors::Error;

pub(crate) mod enact;
pub(crate) mod errors;
pub(crate) mod health;
pub(crate) mod info;
pub(crate) mod node_metadata;
pub(crate) mod reencrypt;

/// A custom header that callers need to send to workers to indicate their
/// version.
#[derive(Debug, Clone)]
pub(crate) struct ProtocolVersion(pub(crate) semver::Version);

impl Header for ProtocolVersion {
    fn name() -> &'static http::HeaderName {
        &tpre_types::api::PROTOCOL_VERSION_HEADER
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, axum_extra::headers::Error>
    where
        Self: Sized,
        I: Iterator<Item = &'i http::HeaderValue>,
    {
        let value = values
            .next()
            .ok_or_else(headers::Error::invalid)?
            .to_str()
            .map_err(|err| {
                tracing::trace!("could not convert header to string: {err:?}");
                headers::Error::invalid()
            })?;
        if values.next().is_some() {
            Err(headers::Error::invalid())
        } else {
            let version = semver::Version::parse(value).map_err(|err| {
                tracing::trace!("could not parse header version: {err:?}");
                headers::Error::invalid()
            })?;
            Ok(ProtocolVersion(version))
        }
    }

    fn encode<E: Extend<http::HeaderValue>>(&self, values: &mut E) {
        let encoded = HeaderValue::from_bytes(self.0.to_string().as_bytes())
            .expect("Cannot encode header version");
        values.extend(std::iter::once(encoded));
    }
}

/// Rejects callers whose announced version falls outside the accepted
/// range.
pub(crate) fn check_version(
    accepted: &semver::VersionReq,
    client_version: &semver::Version,
) -> Result<(), Error> {
    if accepted.matches(client_version) {
        Ok(())
    } else {
        Err(Error::ProtocolMismatch {
            expected: accepted.clone(),
            got: client_version.clone(),
        })
    }
}

/// Serializes an envelope into an `application/cbor` response.
pub(crate) fn envelope_response(
    envelope: &tpre_types::wire::Envelope,
) -> axum::response::Response {
    (
        [(http::header::CONTENT_TYPE, "application/cbor")],
        envelope.encode(),
    )
        .into_response()
}
