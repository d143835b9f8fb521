use std::time::Duration;

use taxonomy_sync_core::{
    Transport, TransportError, TransportResponse, MAX_REDIRECTS, REQUEST_TIMEOUT_SECS,
};
use tracing::debug;

const USER_AGENT: &str = concat!("taxonomy-sync/", env!("CARGO_PKG_VERSION"));

/// Blocking HTTP transport backed by a shared `ureq` agent.
///
/// The agent follows up to [`MAX_REDIRECTS`] 301/302/303 redirects, re-issuing them as GET.
/// A 307 or 308 answer to the form POST is not followed; it comes back as the response and the
/// dispatcher reports it as a failed delivery.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .redirects(MAX_REDIRECTS)
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn post_form(
        &self,
        url: &str,
        fields: &[(&str, &str)],
    ) -> Result<TransportResponse, TransportError> {
        debug!(url, fields = fields.len(), "posting term payload");
        match self.agent.post(url).send_form(fields) {
            Ok(response) | Err(ureq::Error::Status(_, response)) => read_response(response),
            Err(ureq::Error::Transport(transport)) => Err(classify(&transport)),
        }
    }
}

fn read_response(response: ureq::Response) -> Result<TransportResponse, TransportError> {
    let status = response.status();
    let body = response
        .into_string()
        .map_err(|err| TransportError::Other(format!("failed to read response body: {err}")))?;
    Ok(TransportResponse { status, body })
}

fn classify(transport: &ureq::Transport) -> TransportError {
    let message = transport.to_string();
    match transport.kind() {
        ureq::ErrorKind::Io if message.contains("timed out") => TransportError::Timeout(message),
        ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed | ureq::ErrorKind::Io => {
            TransportError::Connection(message)
        }
        _ => TransportError::Other(message),
    }
}
