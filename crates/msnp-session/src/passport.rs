//! Passport ticket service over HTTPS.
//!
//! The nexus advertises the login server in a `PassportURLs` header; the
//! login server answers a `Passport1.4` authorization with the ticket in
//! `Authentication-Info`, or redirects to another login server.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::redirect::Policy;
use tracing::{debug, warn};

use msnp_core::{url_encode, Handle};

use crate::auth::{TicketError, TicketService};

/// Default nexus address.
pub const DEFAULT_NEXUS: &str = "https://nexus.passport.com/rdr/pprdr.asp";

/// Login server redirects followed before giving up.
pub const MAX_LOGIN_REDIRECTS: usize = 5;

/// [`TicketService`] talking to a Passport nexus.
#[derive(Debug, Clone)]
pub struct PassportTicketService {
    client: reqwest::Client,
    nexus_url: String,
    max_redirects: usize,
}

impl PassportTicketService {
    pub fn new() -> Result<Self, TicketError> {
        Self::with_nexus(DEFAULT_NEXUS)
    }

    pub fn with_nexus(nexus_url: impl Into<String>) -> Result<Self, TicketError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| TicketError::Network(e.to_string()))?;
        Ok(Self {
            client,
            nexus_url: nexus_url.into(),
            max_redirects: MAX_LOGIN_REDIRECTS,
        })
    }

    async fn login_url(&self) -> Result<String, TicketError> {
        let response = self.client.get(&self.nexus_url).send().await.map_err(classify)?;
        let urls = response
            .headers()
            .get("PassportURLs")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| TicketError::Network("nexus sent no PassportURLs".into()))?;
        parse_login_url(urls).ok_or_else(|| TicketError::InvalidHost(urls.to_string()))
    }
}

#[async_trait]
impl TicketService for PassportTicketService {
    async fn request_ticket(
        &self,
        handle: &Handle,
        password: &str,
        challenge: &str,
    ) -> Result<String, TicketError> {
        let mut url = self.login_url().await?;
        let authorization = format!(
            "Passport1.4 OrgVerb=GET,OrgURL=http%3A%2F%2Fmessenger%2Emsn%2Ecom,sign-in={},pwd={},{}",
            url_encode(handle.as_str()),
            url_encode(password),
            challenge
        );

        for _ in 0..=self.max_redirects {
            debug!(%url, "requesting passport ticket");
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, authorization.as_str())
                .send()
                .await
                .map_err(classify)?;

            match response.status().as_u16() {
                200 => {
                    let info = response
                        .headers()
                        .get("Authentication-Info")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default();
                    return parse_ticket(info)
                        .ok_or_else(|| TicketError::Network("no ticket in Authentication-Info".into()));
                }
                302 => {
                    url = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string)
                        .ok_or_else(|| TicketError::InvalidHost("redirect without Location".into()))?;
                }
                401 => return Err(TicketError::BadPassword),
                status => {
                    warn!(status, "unexpected passport status");
                    return Err(TicketError::Network(format!("unexpected status {status}")));
                }
            }
        }

        Err(TicketError::Network("too many login redirects".into()))
    }
}

fn classify(err: reqwest::Error) -> TicketError {
    if err.is_connect() || err.is_builder() {
        TicketError::InvalidHost(err.to_string())
    } else {
        TicketError::Network(err.to_string())
    }
}

/// Extract the `DALogin` server from a `PassportURLs` header.
pub fn parse_login_url(header: &str) -> Option<String> {
    header
        .split(',')
        .filter_map(|field| field.trim().split_once('='))
        .find(|(key, _)| *key == "DALogin")
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| {
            if value.starts_with("https://") {
                value.to_string()
            } else {
                format!("https://{value}")
            }
        })
}

/// Extract the ticket (`from-PP='…'`) from an `Authentication-Info` header.
pub fn parse_ticket(header: &str) -> Option<String> {
    let start = header.find("from-PP='")? + "from-PP='".len();
    let rest = &header[start..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string()).filter(|ticket| !ticket.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_login_url() {
        let header = "DARealm=Passport.Net,DALogin=login.passport.com/login2.srf,DAReg=x";
        assert_eq!(
            parse_login_url(header),
            Some("https://login.passport.com/login2.srf".to_string())
        );
        assert_eq!(parse_login_url("DARealm=Passport.Net"), None);
    }

    #[test]
    fn test_parse_ticket() {
        let header = "Passport1.4 da-status=success,tname=MSPAuth,from-PP='t=53*1hAu8ADuD3&p=5*nqbuDmf',ru=http://messenger.msn.com";
        assert_eq!(parse_ticket(header), Some("t=53*1hAu8ADuD3&p=5*nqbuDmf".to_string()));
        assert_eq!(parse_ticket("da-status=failed"), None);
    }
}
