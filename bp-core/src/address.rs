//! Address tagged union and its algebra (spec §3, §4.E), grounded in
//! `cgi/Address.cxx` and `RedirectHttps.cxx`: an `Address` names *how* to
//! reach a resource — a TCP peer, a local path, or a CGI/FastCGI/WAS
//! process to spawn — plus everything needed to forward a request into it
//! (script name, path info, query string, interpreter, environment).

use crate::error::GatewayError;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Sticky dispatch policy carried by an `AddressList` (spec §4.F). The
/// policies beyond `Failover` all reduce to the same index-selection rule
/// in `Balancer::get` — they differ only in how the caller derives the
/// sticky hash (client IP, session id, cookie, or JVM route suffix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StickyMode {
    #[default]
    None,
    Failover,
    SourceIp,
    SessionModulo,
    Cookie,
    JvmRoute,
}

/// A load-balanceable group of equivalent addresses (spec §4.E, §4.F).
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    pub addresses: Vec<SocketAddr>,
    pub sticky: StickyMode,
}

impl AddressList {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        AddressList { addresses, sticky: StickyMode::None }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }
}

/// Common CGI-family fields shared by CGI, FastCGI, and WAS addresses
/// (`cgi/Address.cxx`'s `CgiAddress`).
#[derive(Debug, Clone, Default)]
pub struct CgiAddress {
    pub path: String,
    pub interpreter: Option<String>,
    pub action: Option<String>,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub document_root: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Parallelism hint; FastCGI/WAS processes may be pooled under this key.
    pub concurrency: u16,
}

impl CgiAddress {
    pub fn new(path: impl Into<String>) -> Self {
        CgiAddress { path: path.into(), concurrency: 1, ..Default::default() }
    }

    /// `GetId()` — a string uniquely identifying this address for cache
    /// keying and connection pooling, combining path, interpreter, and args
    /// so two addresses with the same `path` but different args don't alias.
    pub fn get_id(&self) -> String {
        let mut id = self.path.clone();
        if let Some(interp) = &self.interpreter {
            id.push(';');
            id.push_str(interp);
        }
        for arg in &self.args {
            id.push(' ');
            id.push_str(arg);
        }
        id
    }

    /// `Check()` — validates that mandatory fields are present before the
    /// address is used to spawn a process.
    pub fn check(&self) -> Result<(), GatewayError> {
        if self.path.is_empty() {
            return Err(GatewayError::Config("CGI address missing path".into()));
        }
        Ok(())
    }

    /// `GetURI()` — reassembles the request URI this address was invoked
    /// with: `script_name` followed by `path_info`, deduplicating the slash
    /// when both meet at the join, then `?query_string` if present.
    pub fn get_uri(&self) -> String {
        let script_name = self.script_name.as_deref().unwrap_or("");
        let path_info = self.path_info.as_deref().unwrap_or("");
        let mut out = String::with_capacity(script_name.len() + path_info.len() + 1);
        out.push_str(script_name);
        if script_name.ends_with('/') && path_info.starts_with('/') {
            out.push_str(&path_info[1..]);
        } else {
            out.push_str(path_info);
        }
        if let Some(q) = &self.query_string {
            out.push('?');
            out.push_str(q);
        }
        out
    }
}

/// `Address` tagged union (spec §3's Address type, §4.E).
#[derive(Debug, Clone)]
pub enum Address {
    /// No address — a request with nothing to forward to.
    None,
    /// Serve a file directly from the local filesystem (no subprocess).
    Local { document_root: String, path_info: String },
    /// HTTP(S) over TCP to one of several equivalent backends.
    Http { addresses: AddressList, host: Option<String> },
    /// HTTP over a local Unix domain socket ("LHTTP" in the source).
    LHttp { socket_path: String, cgi: CgiAddress },
    /// A named pipe / coprocess invoked per-request.
    Pipe(CgiAddress),
    /// Classic CGI: fork+exec per request.
    Cgi(CgiAddress),
    /// FastCGI: persistent worker processes over a socket.
    FastCgi { socket_path: String, cgi: CgiAddress },
    /// WAS (Web Application Socket): multiplexed protocol over a pair of
    /// pipes plus a control channel.
    Was { executable_path: String, cgi: CgiAddress },
    /// NFS-mounted file, addressed by export + path rather than local FS.
    Nfs { server: String, export: String, path: String },
}

impl Address {
    /// `GetId()` — stable string key for logging, cache keys, pooling.
    pub fn get_id(&self) -> String {
        match self {
            Address::None => "none".to_string(),
            Address::Local { document_root, path_info } => format!("local:{document_root}{path_info}"),
            Address::Http { addresses, host } => {
                let hosts: Vec<String> = addresses.addresses.iter().map(|a| a.to_string()).collect();
                match host {
                    Some(h) => format!("http:{h}@{}", hosts.join(",")),
                    None => format!("http:{}", hosts.join(",")),
                }
            }
            Address::LHttp { socket_path, cgi } => format!("lhttp:{socket_path}:{}", cgi.get_id()),
            Address::Pipe(cgi) => format!("pipe:{}", cgi.get_id()),
            Address::Cgi(cgi) => format!("cgi:{}", cgi.get_id()),
            Address::FastCgi { socket_path, cgi } => format!("fastcgi:{socket_path}:{}", cgi.get_id()),
            Address::Was { executable_path, cgi } => format!("was:{executable_path}:{}", cgi.get_id()),
            Address::Nfs { server, export, path } => format!("nfs:{server}:{export}{path}"),
        }
    }

    /// `Check()` — structural validation before dispatch.
    pub fn check(&self) -> Result<(), GatewayError> {
        match self {
            Address::None => Err(GatewayError::Config("address is None".into())),
            Address::Local { document_root, .. } => {
                if document_root.is_empty() {
                    Err(GatewayError::Config("local address missing document_root".into()))
                } else {
                    Ok(())
                }
            }
            Address::Http { addresses, .. } => {
                if addresses.is_empty() {
                    Err(GatewayError::Config("http address has no backends".into()))
                } else {
                    Ok(())
                }
            }
            Address::LHttp { socket_path, cgi } | Address::FastCgi { socket_path, cgi } => {
                if socket_path.is_empty() {
                    Err(GatewayError::Config("socket address missing path".into()))
                } else {
                    cgi.check()
                }
            }
            Address::Pipe(cgi) | Address::Cgi(cgi) => cgi.check(),
            Address::Was { executable_path, cgi } => {
                if executable_path.is_empty() {
                    Err(GatewayError::Config("WAS address missing executable_path".into()))
                } else {
                    cgi.check()
                }
            }
            Address::Nfs { server, export, .. } => {
                if server.is_empty() || export.is_empty() {
                    Err(GatewayError::Config("NFS address missing server/export".into()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// `AutoBase()` — derives a base URI from PATH_INFO for addresses that
    /// carry one, used when the translation response omits an explicit
    /// BASE (spec §4.E). The base is the largest prefix of `uri` that,
    /// with `path_info` appended, reconstructs `uri` exactly; it always
    /// ends in a slash. Returns `None` if `uri` doesn't actually end with
    /// this address's `path_info`.
    pub fn auto_base(&self, uri: &str) -> Option<String> {
        let cgi = match self {
            Address::LHttp { cgi, .. }
            | Address::Pipe(cgi)
            | Address::Cgi(cgi)
            | Address::FastCgi { cgi, .. }
            | Address::Was { cgi, .. } => Some(cgi),
            _ => None,
        }?;
        let path_info = cgi.path_info.as_deref()?;
        if path_info.is_empty() {
            return None;
        }
        let prefix = uri.strip_suffix(path_info)?;
        if prefix.ends_with('/') {
            Some(prefix.to_string())
        } else {
            Some(format!("{prefix}/"))
        }
    }

    /// `MakeHttpsRedirect(host, port, uri)` — builds the `https://` target
    /// for a plain-HTTP-to-TLS redirect (`RedirectHttps.cxx`). `host` may
    /// already carry a `:port` suffix (stripped and replaced by `port`);
    /// port 0 or 443 is elided since it's the scheme default. Bare IPv6
    /// literals (anything containing a colon once the port is stripped)
    /// are bracketed per RFC 3986.
    pub fn make_https_redirect(host: &str, port: u16, uri: &str) -> String {
        let bare_host = Self::strip_port(host);
        let host_display = if bare_host.contains(':') { format!("[{bare_host}]") } else { bare_host.to_string() };
        if port == 0 || port == 443 {
            format!("https://{host_display}{uri}")
        } else {
            format!("https://{host_display}:{port}{uri}")
        }
    }

    /// Strips a trailing `:<digits>` port suffix, but only when the
    /// remainder doesn't itself contain a colon — otherwise `host` is a
    /// bare IPv6 literal (e.g. `::`) with no port attached.
    fn strip_port(host: &str) -> &str {
        if let Some((h, p)) = host.rsplit_once(':') {
            if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) && !h.contains(':') {
                return h;
            }
        }
        host
    }

    /// `SaveBase(uri, base)` — strips `base` as a URI prefix, returning the
    /// remainder to store as PATH_INFO (`RedirectHttps.cxx` uses the same
    /// prefix-stripping shape when rewriting Location headers onto https).
    pub fn save_base<'a>(uri: &'a str, base: &str) -> Option<&'a str> {
        uri.strip_prefix(base)
    }

    /// `LoadBase(request_uri, tail)` — inverse of `save_base`: reattaches a
    /// previously saved tail onto a new base, used when replaying a cached
    /// BASE-relative address against a fresh incoming request.
    pub fn load_base(base: &str, tail: &str) -> String {
        let mut out = String::with_capacity(base.len() + tail.len());
        out.push_str(base);
        out.push_str(tail);
        out
    }

    /// `Apply(relative)` — resolves a relative reference against this
    /// address, as used to follow an internal redirect to a sibling
    /// resource on the same backend. Only meaningful for CGI-family and
    /// local addresses; HTTP/NFS addresses return themselves unchanged
    /// since the relative path is resolved by the peer, not here.
    pub fn apply_relative(&self, relative: &str) -> Address {
        match self {
            Address::Local { document_root, path_info } => Address::Local {
                document_root: document_root.clone(),
                path_info: Self::relative_to(path_info, relative),
            },
            Address::Cgi(cgi) => Address::Cgi(Self::apply_relative_cgi(cgi, relative)),
            Address::Pipe(cgi) => Address::Pipe(Self::apply_relative_cgi(cgi, relative)),
            Address::LHttp { socket_path, cgi } => Address::LHttp {
                socket_path: socket_path.clone(),
                cgi: Self::apply_relative_cgi(cgi, relative),
            },
            Address::FastCgi { socket_path, cgi } => Address::FastCgi {
                socket_path: socket_path.clone(),
                cgi: Self::apply_relative_cgi(cgi, relative),
            },
            Address::Was { executable_path, cgi } => Address::Was {
                executable_path: executable_path.clone(),
                cgi: Self::apply_relative_cgi(cgi, relative),
            },
            other => other.clone(),
        }
    }

    fn apply_relative_cgi(cgi: &CgiAddress, relative: &str) -> CgiAddress {
        let mut next = cgi.clone();
        next.path_info = Some(Self::relative_to(cgi.path_info.as_deref().unwrap_or("/"), relative));
        next
    }

    /// `RelativeTo(base, relative)` — RFC 3986-style reference resolution,
    /// restricted to the subset the source actually relies on: absolute
    /// relative references replace the path outright; `../`-free relative
    /// references are appended to the base's directory.
    fn relative_to(base: &str, relative: &str) -> String {
        if relative.starts_with('/') {
            return relative.to_string();
        }
        let dir = match base.rfind('/') {
            Some(idx) => &base[..=idx],
            None => "/",
        };
        format!("{dir}{relative}")
    }

    /// `Expand(params)` — substitutes `$1`-style placeholders captured by a
    /// translation regex match into this address's CGI fields (script
    /// name, path info, args, env values). Mirrors the source's
    /// `Expand()` methods used after a REGEX translation match.
    pub fn expand(&self, params: &[&str]) -> Address {
        fn expand_str(s: &str, params: &[&str]) -> String {
            let mut out = String::with_capacity(s.len());
            let mut chars = s.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '$' {
                    if let Some(&next) = chars.peek() {
                        if let Some(idx) = next.to_digit(10) {
                            chars.next();
                            if let Some(val) = params.get(idx as usize) {
                                out.push_str(val);
                            }
                            continue;
                        }
                    }
                }
                out.push(c);
            }
            out
        }
        fn expand_cgi(cgi: &CgiAddress, params: &[&str]) -> CgiAddress {
            let mut next = cgi.clone();
            next.path = expand_str(&cgi.path, params);
            next.path_info = cgi.path_info.as_deref().map(|p| expand_str(p, params));
            next.args = cgi.args.iter().map(|a| expand_str(a, params)).collect();
            next
        }
        match self {
            Address::Local { document_root, path_info } => Address::Local {
                document_root: document_root.clone(),
                path_info: expand_str(path_info, params),
            },
            Address::Cgi(cgi) => Address::Cgi(expand_cgi(cgi, params)),
            Address::Pipe(cgi) => Address::Pipe(expand_cgi(cgi, params)),
            Address::LHttp { socket_path, cgi } => {
                Address::LHttp { socket_path: socket_path.clone(), cgi: expand_cgi(cgi, params) }
            }
            Address::FastCgi { socket_path, cgi } => {
                Address::FastCgi { socket_path: socket_path.clone(), cgi: expand_cgi(cgi, params) }
            }
            Address::Was { executable_path, cgi } => {
                Address::Was { executable_path: executable_path.clone(), cgi: expand_cgi(cgi, params) }
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_id_distinguishes_args() {
        let mut a = CgiAddress::new("/usr/bin/php");
        a.args = vec!["--a".into()];
        let mut b = CgiAddress::new("/usr/bin/php");
        b.args = vec!["--b".into()];
        assert_ne!(a.get_id(), b.get_id());
    }

    #[test]
    fn test_check_rejects_empty_path() {
        let addr = Address::Cgi(CgiAddress::default());
        assert!(addr.check().is_err());
    }

    #[test]
    fn test_save_base_strips_prefix() {
        assert_eq!(Address::save_base("/app/foo/bar", "/app/"), Some("foo/bar"));
        assert_eq!(Address::save_base("/other", "/app/"), None);
    }

    #[test]
    fn test_load_base_reattaches_tail() {
        assert_eq!(Address::load_base("/app/", "foo/bar"), "/app/foo/bar");
    }

    #[test]
    fn test_relative_to_absolute_replaces() {
        assert_eq!(Address::relative_to("/a/b/c", "/x/y"), "/x/y");
    }

    #[test]
    fn test_relative_to_relative_appends_to_dir() {
        assert_eq!(Address::relative_to("/a/b/c", "d"), "/a/b/d");
    }

    #[test]
    fn test_apply_relative_on_cgi_updates_path_info() {
        let mut cgi = CgiAddress::new("/usr/bin/php");
        cgi.path_info = Some("/index.php".into());
        let addr = Address::Cgi(cgi);
        let applied = addr.apply_relative("other.php");
        if let Address::Cgi(c) = applied {
            assert_eq!(c.path_info.as_deref(), Some("/other.php"));
        } else {
            panic!("expected Cgi variant");
        }
    }

    #[test]
    fn test_expand_substitutes_capture_groups() {
        let mut cgi = CgiAddress::new("/usr/bin/php");
        cgi.path_info = Some("/users/$1/profile".into());
        let addr = Address::Cgi(cgi);
        let expanded = addr.expand(&["", "42"]);
        if let Address::Cgi(c) = expanded {
            assert_eq!(c.path_info.as_deref(), Some("/users/42/profile"));
        } else {
            panic!("expected Cgi variant");
        }
    }

    #[test]
    fn test_get_uri_joins_script_name_and_path_info() {
        let cgi = CgiAddress {
            script_name: Some("/test.cgi".into()),
            path_info: Some("/foo".into()),
            query_string: Some("a=b".into()),
            ..CgiAddress::new("/usr/bin/php")
        };
        assert_eq!(cgi.get_uri(), "/test.cgi/foo?a=b");
    }

    #[test]
    fn test_get_uri_dedups_slash_when_script_name_ends_in_one() {
        let cgi = CgiAddress {
            script_name: Some("/bar/".into()),
            path_info: Some("/foo".into()),
            query_string: Some("a=b".into()),
            ..CgiAddress::new("/usr/bin/php")
        };
        assert_eq!(cgi.get_uri(), "/bar/foo?a=b");
    }

    #[test]
    fn test_auto_base_strips_path_info_suffix() {
        let mut cgi = CgiAddress::new("/usr/bin/php");
        cgi.path_info = Some("/bar/baz".into());
        let addr = Address::Cgi(cgi);
        assert_eq!(addr.auto_base("/foo/bar/baz"), Some("/foo/".to_string()));
    }

    #[test]
    fn test_auto_base_mismatched_tail_returns_none() {
        let mut cgi = CgiAddress::new("/usr/bin/php");
        cgi.path_info = Some("/bar/baz".into());
        let addr = Address::Cgi(cgi);
        assert_eq!(addr.auto_base("/foo/other"), None);
    }

    #[test]
    fn test_make_https_redirect_examples() {
        assert_eq!(Address::make_https_redirect("localhost", 0, "/foo"), "https://localhost/foo");
        assert_eq!(Address::make_https_redirect("localhost:80", 0, "/foo"), "https://localhost/foo");
        assert_eq!(Address::make_https_redirect("localhost:80", 444, "/foo"), "https://localhost:444/foo");
        assert_eq!(Address::make_https_redirect("::", 444, "/foo"), "https://[::]:444/foo");
    }

    #[test]
    fn test_http_address_get_id_includes_host() {
        let addr = Address::Http {
            addresses: AddressList::new(vec!["127.0.0.1:8080".parse().unwrap()]),
            host: Some("example.com".into()),
        };
        assert_eq!(addr.get_id(), "http:example.com@127.0.0.1:8080");
    }
}
