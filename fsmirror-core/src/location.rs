use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

pub const URL_SCHEME: &str = "fsmirror";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("unsupported scheme: {0}")]
    Scheme(String),
    #[error("missing peer id in {0}")]
    MissingPeer(String),
    #[error("invalid percent-encoding in {0}")]
    Encoding(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Address of a file on a peer: `fsmirror:/<peer>/<path>`.
///
/// The path is kept in cross-platform form, so a Windows file reads
/// `fsmirror:/<peer>/C:/dir/file.txt` and a POSIX one
/// `fsmirror:/<peer>/home/user/file.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteUrl {
    pub peer_id: String,
    pub path: String,
}

impl RemoteUrl {
    pub fn new(peer_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            path: path.into(),
        }
    }

    pub fn to_url(&self) -> Result<Url, LocationError> {
        Ok(Url::parse(&self.to_string())?)
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(|segment| {
            if has_drive_prefix(segment) && segment.len() == 2 {
                segment.to_string()
            } else {
                urlencoding::encode(segment).into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{URL_SCHEME}:/{}/{}",
            urlencoding::encode(&self.peer_id),
            encode_path(&self.path)
        )
    }
}

impl FromStr for RemoteUrl {
    type Err = LocationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = value
            .split_once(':')
            .ok_or_else(|| LocationError::Scheme(value.to_string()))?;
        if !scheme.eq_ignore_ascii_case(URL_SCHEME) {
            return Err(LocationError::Scheme(scheme.to_string()));
        }
        let rest = rest.trim_start_matches('/');
        let (peer, raw_path) = rest.split_once('/').unwrap_or((rest, ""));
        if peer.is_empty() {
            return Err(LocationError::MissingPeer(value.to_string()));
        }
        let peer_id = urlencoding::decode(peer)
            .map_err(|_| LocationError::Encoding(value.to_string()))?
            .into_owned();
        let decoded = urlencoding::decode(raw_path)
            .map_err(|_| LocationError::Encoding(value.to_string()))?
            .into_owned();
        let path = if has_drive_prefix(&decoded) {
            decoded
        } else {
            format!("/{decoded}")
        };
        Ok(Self { peer_id, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_path_formats_and_parses() {
        let url = RemoteUrl::new("agent-1", "/home/user/notes.txt");
        assert_eq!(url.to_string(), "fsmirror:/agent-1/home/user/notes.txt");
        assert_eq!(url.to_string().parse::<RemoteUrl>().unwrap(), url);
    }

    #[test]
    fn windows_path_keeps_drive_letter() {
        let url = RemoteUrl::new("win", "C:/Users/me/a b.txt");
        let text = url.to_string();
        assert_eq!(text, "fsmirror:/win/C:/Users/me/a%20b.txt");
        let parsed: RemoteUrl = text.parse().unwrap();
        assert_eq!(parsed.path, "C:/Users/me/a b.txt");
    }

    #[test]
    fn peer_id_with_separators_is_encoded() {
        let url = RemoteUrl::new("TCP:host:1534", "/tmp/x");
        let text = url.to_string();
        assert!(text.starts_with("fsmirror:/TCP%3Ahost%3A1534/"));
        assert_eq!(text.parse::<RemoteUrl>().unwrap().peer_id, "TCP:host:1534");
    }

    #[test]
    fn other_schemes_are_rejected() {
        let err = "http://example.com/x".parse::<RemoteUrl>().unwrap_err();
        assert_eq!(err, LocationError::Scheme("http".into()));
    }

    #[test]
    fn converts_to_url() {
        let url = RemoteUrl::new("agent", "/var/log").to_url().unwrap();
        assert_eq!(url.scheme(), URL_SCHEME);
    }
}
