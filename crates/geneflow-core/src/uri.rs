//! Parsing and normalization of `scheme://authority/path` URIs.
//!
//! Every location the engine touches is addressed by URI. Bare paths are
//! interpreted as `local://` URIs; `~` is expanded for local paths.

use std::env;
use std::io;

use regex::Regex;

use crate::error::{CoreError, Result};

/// Schemes with a data-manager handler.
pub const DATA_SCHEMES: &[&str] = &["local", "agave"];

/// Schemes the parser accepts. `http`/`https` are valid only as
/// notification endpoints; the data manager has no handler for them.
pub const VALID_SCHEMES: &[&str] = &["local", "agave", "http", "https"];

/// A parsed, normalized URI.
///
/// `chopped_path` is `path` without any trailing slash; `name` is the last
/// path segment and `folder` its parent. `chopped_uri` recomposes
/// `scheme://authority` with `chopped_path` and reparses to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub chopped_path: String,
    pub folder: String,
    pub name: String,
    pub chopped_uri: String,
}

impl ParsedUri {
    /// Parse and normalize a URI string.
    pub fn parse(uri: &str) -> Result<ParsedUri> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(CoreError::InvalidUri("empty uri".to_string()));
        }

        let (scheme, authority, raw_path) = match uri.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = scheme.to_lowercase();
                if !VALID_SCHEMES.contains(&scheme.as_str()) {
                    return Err(CoreError::InvalidUri(format!(
                        "unknown scheme '{}': {}",
                        scheme, uri
                    )));
                }
                let (authority, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, ""),
                };
                let authority_re = Regex::new(r"^[A-Za-z0-9._-]*$").map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
                })?;
                if !authority_re.is_match(authority) {
                    return Err(CoreError::InvalidUri(format!(
                        "malformed authority '{}': {}",
                        authority, uri
                    )));
                }
                if scheme == "local" && !authority.is_empty() {
                    return Err(CoreError::InvalidUri(format!(
                        "local uris cannot carry an authority: {}",
                        uri
                    )));
                }
                if scheme != "local" && authority.is_empty() {
                    return Err(CoreError::InvalidUri(format!(
                        "missing authority for scheme '{}': {}",
                        scheme, uri
                    )));
                }
                (scheme, authority.to_string(), path.to_string())
            }
            None => {
                // bare path: a local uri with empty authority
                let mut path = uri.to_string();
                if path == "~" || path.starts_with("~/") {
                    let home = env::var("HOME").map_err(|_| {
                        CoreError::InvalidUri(format!("cannot expand '~': {}", uri))
                    })?;
                    path = format!("{}{}", home, &path[1..]);
                }
                if !path.starts_with('/') {
                    let cwd = env::current_dir()?;
                    path = format!("{}/{}", cwd.display(), path);
                }
                ("local".to_string(), String::new(), path)
            }
        };

        if raw_path.is_empty() {
            return Err(CoreError::InvalidUri(format!("empty path: {}", uri)));
        }

        let trailing_slash = raw_path.len() > 1 && raw_path.ends_with('/');
        let chopped_path = normalize_path(&raw_path)
            .ok_or_else(|| CoreError::InvalidUri(format!("invalid path: {}", uri)))?;

        let path = if trailing_slash && chopped_path != "/" {
            format!("{}/", chopped_path)
        } else {
            chopped_path.clone()
        };

        let (folder, name) = match chopped_path.rsplit_once('/') {
            Some(("", "")) => ("/".to_string(), String::new()),
            Some(("", name)) => ("/".to_string(), name.to_string()),
            Some((folder, name)) => (folder.to_string(), name.to_string()),
            None => (String::new(), chopped_path.clone()),
        };

        let chopped_uri = format!("{}://{}{}", scheme, authority, chopped_path);

        Ok(ParsedUri {
            scheme,
            authority,
            path,
            chopped_path,
            folder,
            name,
            chopped_uri,
        })
    }

    /// Append a relative segment to this URI and reparse.
    pub fn join(&self, segment: &str) -> Result<ParsedUri> {
        let segment = segment.trim_start_matches('/');
        if self.chopped_path == "/" {
            ParsedUri::parse(&format!("{}{}", self.chopped_uri, segment))
        } else {
            ParsedUri::parse(&format!("{}/{}", self.chopped_uri, segment))
        }
    }

    /// The URI of this location's parent folder.
    pub fn folder_uri(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.folder)
    }
}

impl std::fmt::Display for ParsedUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.chopped_uri)
    }
}

/// Collapse duplicate slashes and resolve `.`/`..`. Returns `None` when
/// `..` escapes the root. The result never has a trailing slash (except
/// the root itself).
fn normalize_path(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{}", segments.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri = ParsedUri::parse("agave://data.storage/home/user/files/").unwrap();
        assert_eq!(uri.scheme, "agave");
        assert_eq!(uri.authority, "data.storage");
        assert_eq!(uri.path, "/home/user/files/");
        assert_eq!(uri.chopped_path, "/home/user/files");
        assert_eq!(uri.folder, "/home/user");
        assert_eq!(uri.name, "files");
        assert_eq!(uri.chopped_uri, "agave://data.storage/home/user/files");
    }

    #[test]
    fn test_parse_bare_path_is_local() {
        let uri = ParsedUri::parse("/data/reads").unwrap();
        assert_eq!(uri.scheme, "local");
        assert_eq!(uri.authority, "");
        assert_eq!(uri.chopped_uri, "local:///data/reads");
    }

    #[test]
    fn test_parse_normalizes_dots_and_slashes() {
        let uri = ParsedUri::parse("local:///a//b/./c/../d").unwrap();
        assert_eq!(uri.chopped_path, "/a/b/d");
        assert_eq!(uri.name, "d");
        assert_eq!(uri.folder, "/a/b");
    }

    #[test]
    fn test_parse_rejects_escape_from_root() {
        assert!(ParsedUri::parse("local:///../etc").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(ParsedUri::parse("ftp://host/path").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_path() {
        assert!(ParsedUri::parse("agave://storage").is_err());
        assert!(ParsedUri::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_authority() {
        assert!(ParsedUri::parse("agave://bad host/path").is_err());
        assert!(ParsedUri::parse("agave:///path").is_err());
        assert!(ParsedUri::parse("local://host/path").is_err());
    }

    #[test]
    fn test_root_path() {
        let uri = ParsedUri::parse("local:///").unwrap();
        assert_eq!(uri.chopped_path, "/");
        assert_eq!(uri.name, "");
        assert_eq!(uri.folder, "/");
    }

    #[test]
    fn test_parse_idempotent_on_chopped_uri() {
        for raw in [
            "local:///work/job//step/",
            "agave://sys.id/archive/./jobs",
            "/top/level",
        ] {
            let first = ParsedUri::parse(raw).unwrap();
            let second = ParsedUri::parse(&first.chopped_uri).unwrap();
            assert_eq!(first.chopped_uri, second.chopped_uri);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_join() {
        let base = ParsedUri::parse("local:///work").unwrap();
        let joined = base.join("step1/_log").unwrap();
        assert_eq!(joined.chopped_uri, "local:///work/step1/_log");
        assert_eq!(joined.name, "_log");
    }

    #[test]
    fn test_folder_uri_round_trips() {
        let uri = ParsedUri::parse("agave://sys/data/a/b.txt").unwrap();
        let parent = ParsedUri::parse(&uri.folder_uri()).unwrap();
        assert_eq!(parent.chopped_uri, "agave://sys/data/a");
    }
}
