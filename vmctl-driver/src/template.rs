//! Launch-argument templating.
//!
//! Arguments may embed `{{ fd_connect "/path/to.sock" }}` directives. Each
//! directive connects to the named Unix socket and is replaced by the
//! descriptor number the emulator will see that connection under. Expansion
//! runs in two phases: every argument is parsed first, so a syntax error never
//! leaves half-opened sockets behind, then directives are resolved left to
//! right through an [`FdConnector`].

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::DriverError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// First descriptor number available after stdin, stdout and stderr.
pub const FIRST_INHERITED_FD: usize = 3;

/// A piece of a parsed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Literal text copied through unchanged.
    Text(&'a str),
    /// Connect to the socket at this path and substitute the descriptor number.
    FdConnect(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Str(String),
}

/// Parse one argument into literal text and directives.
///
/// # Errors
/// Returns a description of the first syntax error found.
pub fn parse(arg: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = arg;
    while let Some(open) = rest.find(OPEN) {
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        let (tokens, after) = lex_action(&rest[open + OPEN.len()..])?;
        if let Some(segment) = directive(tokens)? {
            segments.push(segment);
        }
        rest = after;
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

/// Tokenize the body of one action, returning the tokens and the text after `}}`.
fn lex_action(src: &str) -> Result<(Vec<Token<'_>>, &str), String> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < src.len() {
        let rest = &src[i..];
        let Some(c) = rest.chars().next() else { break };
        if rest.starts_with(CLOSE) {
            return Ok((tokens, &src[i + CLOSE.len()..]));
        }
        if rest.starts_with("/*") {
            let end = rest.find("*/").ok_or("unclosed comment")?;
            i += end + 2;
            continue;
        }
        match c {
            c if c.is_whitespace() => i += c.len_utf8(),
            '"' => {
                let (value, used) = lex_quoted(&rest[1..])?;
                tokens.push(Token::Str(value));
                i += 1 + used;
            }
            '`' => {
                let end = rest[1..].find('`').ok_or("unterminated raw string")?;
                tokens.push(Token::Str(rest[1..=end].to_owned()));
                i += end + 2;
            }
            c if c.is_alphabetic() || c == '_' => {
                let len = rest
                    .find(|ch: char| !(ch.is_alphanumeric() || ch == '_'))
                    .unwrap_or(rest.len());
                tokens.push(Token::Ident(&rest[..len]));
                i += len;
            }
            other => return Err(format!("unexpected {other:?} in action")),
        }
    }
    Err("unclosed action".to_owned())
}

/// Read a double-quoted string body; returns the value and bytes consumed
/// including the closing quote.
fn lex_quoted(src: &str) -> Result<(String, usize), String> {
    let mut value = String::new();
    let mut chars = src.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, i + 1)),
            '\n' => break,
            '\\' => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, other)) => return Err(format!("unknown escape sequence \\{other}")),
                None => break,
            },
            c => value.push(c),
        }
    }
    Err("unterminated quoted string".to_owned())
}

fn directive(tokens: Vec<Token<'_>>) -> Result<Option<Segment<'static>>, String> {
    let mut tokens = tokens.into_iter();
    let name = match tokens.next() {
        None => return Ok(None),
        Some(Token::Ident(name)) => name,
        Some(Token::Str(s)) => return Err(format!("can't give argument to non-function {s:?}")),
    };
    if name != "fd_connect" {
        return Err(format!("function {name:?} not defined"));
    }
    let path = match tokens.next() {
        Some(Token::Str(path)) => path,
        Some(Token::Ident(other)) => {
            return Err(format!("fd_connect: non-string argument {other}"));
        }
        None => return Err("fd_connect: want 1 argument, got 0".to_owned()),
    };
    let extra = tokens.count();
    if extra > 0 {
        return Err(format!("fd_connect: want 1 argument, got {}", extra + 1));
    }
    Ok(Some(Segment::FdConnect(path)))
}

/// Opens the connection behind an `fd_connect` directive.
pub trait FdConnector {
    /// Connect to the socket at `path` and return the connected descriptor.
    ///
    /// # Errors
    /// Any I/O error aborts the whole expansion.
    fn connect(&mut self, path: &Path) -> std::io::Result<OwnedFd>;
}

/// Connects to local stream sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixFdConnector;

impl FdConnector for UnixFdConnector {
    fn connect(&mut self, path: &Path) -> std::io::Result<OwnedFd> {
        UnixStream::connect(path).map(OwnedFd::from)
    }
}

/// Expands launch arguments and accumulates the descriptors the child inherits.
///
/// The descriptor for the `n`th connection (zero-based) is `n + 3`.
#[derive(Debug, Default)]
pub struct ArgTemplater<C = UnixFdConnector> {
    connector: C,
    files: Vec<OwnedFd>,
}

impl ArgTemplater {
    /// Create a templater that opens real Unix socket connections.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(UnixFdConnector)
    }
}

impl<C: FdConnector> ArgTemplater<C> {
    /// Create a templater using the given connection capability.
    #[must_use]
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector,
            files: Vec::new(),
        }
    }

    /// Expand a single argument.
    ///
    /// Arguments without `{{` are returned as-is.
    ///
    /// # Errors
    /// Returns [`DriverError::Template`] on a syntax error and
    /// [`DriverError::FdConnect`] if a socket cannot be connected.
    pub fn apply(&mut self, arg: &str) -> Result<String, DriverError> {
        if !arg.contains(OPEN) {
            return Ok(arg.to_owned());
        }
        let segments = parse(arg).map_err(|reason| DriverError::Template {
            arg: arg.to_owned(),
            reason,
        })?;
        self.resolve(&segments)
    }

    /// Expand every argument, parsing all of them before opening any socket.
    ///
    /// # Errors
    /// See [`ArgTemplater::apply`]. On error no further sockets are opened.
    pub fn apply_all<S: AsRef<str>>(&mut self, args: &[S]) -> Result<Vec<String>, DriverError> {
        let parsed = args
            .iter()
            .map(|arg| {
                let arg = arg.as_ref();
                if !arg.contains(OPEN) {
                    return Ok(None);
                }
                parse(arg).map(Some).map_err(|reason| DriverError::Template {
                    arg: arg.to_owned(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        args.iter()
            .zip(parsed)
            .map(|(arg, segments)| match segments {
                None => Ok(arg.as_ref().to_owned()),
                Some(segments) => self.resolve(&segments),
            })
            .collect()
    }

    fn resolve(&mut self, segments: &[Segment<'_>]) -> Result<String, DriverError> {
        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::FdConnect(path) => {
                    let fd = self.connector.connect(Path::new(path)).map_err(|source| {
                        DriverError::FdConnect {
                            path: path.into(),
                            source,
                        }
                    })?;
                    self.files.push(fd);
                    let index = self.files.len() + FIRST_INHERITED_FD - 1;
                    out.push_str(&index.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Descriptors opened so far, in discovery order.
    #[must_use]
    pub fn files(&self) -> &[OwnedFd] {
        &self.files
    }

    /// Consume the templater, handing over the opened descriptors.
    #[must_use]
    pub fn into_files(self) -> Vec<OwnedFd> {
        self.files
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io;
    use std::path::PathBuf;

    use super::*;

    /// Hands out `/dev/null` descriptors and records requested paths.
    #[derive(Default)]
    struct FakeConnector {
        opened: Vec<PathBuf>,
        refuse: Option<PathBuf>,
    }

    impl FdConnector for FakeConnector {
        fn connect(&mut self, path: &Path) -> io::Result<OwnedFd> {
            if self.refuse.as_deref() == Some(path) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            self.opened.push(path.to_owned());
            File::open("/dev/null").map(OwnedFd::from)
        }
    }

    fn templater() -> ArgTemplater<FakeConnector> {
        ArgTemplater::with_connector(FakeConnector::default())
    }

    #[test]
    fn plain_argument_passes_through() {
        let mut t = templater();
        let out = t.apply("-m 4096").ok();
        assert_eq!(out.as_deref(), Some("-m 4096"));
        assert!(t.files().is_empty());
    }

    #[test]
    fn fd_connect_substitutes_first_inherited_fd() {
        let mut t = templater();
        let out = t.apply(r#"socket,id=net0,fd={{ fd_connect "/run/net.sock" }}"#);
        assert_eq!(out.ok().as_deref(), Some("socket,id=net0,fd=3"));
        assert_eq!(t.files().len(), 1);
        assert_eq!(t.connector.opened, vec![PathBuf::from("/run/net.sock")]);
    }

    #[test]
    fn same_socket_twice_opens_two_connections() {
        let mut t = templater();
        let out = t.apply(r#"{{fd_connect "/a"}},{{fd_connect "/a"}}"#);
        assert_eq!(out.ok().as_deref(), Some("3,4"));
        assert_eq!(t.connector.opened.len(), 2, "directives must not be cached");
    }

    #[test]
    fn raw_and_escaped_strings_are_accepted() {
        let mut t = templater();
        assert!(t.apply(r#"{{fd_connect `/tmp/raw "q"`}}"#).is_ok());
        assert!(t.apply(r#"{{fd_connect "/tmp/a\"b"}}"#).is_ok());
        assert_eq!(
            t.connector.opened,
            vec![PathBuf::from(r#"/tmp/raw "q""#), PathBuf::from(r#"/tmp/a"b"#)]
        );
    }

    #[test]
    fn comment_and_empty_actions_expand_to_nothing() {
        let mut t = templater();
        let out = t.apply("a{{/* note */}}b{{ }}c");
        assert_eq!(out.ok().as_deref(), Some("abc"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        for bad in [
            "{{fd_connect \"/a\"",
            "{{ nope \"/a\" }}",
            "{{ fd_connect }}",
            "{{ fd_connect \"/a\" \"/b\" }}",
            "{{ fd_connect other }}",
            "{{ \"/a\" }}",
            "{{ fd_connect \"/a\\q\" }}",
            "{{ 42 }}",
        ] {
            let mut t = templater();
            let res = t.apply(bad);
            assert!(
                matches!(res, Err(DriverError::Template { .. })),
                "{bad:?} must be a template error, got {res:?}"
            );
            assert!(t.connector.opened.is_empty(), "{bad:?} must not open sockets");
        }
    }

    #[test]
    fn connect_failure_is_fatal() {
        let mut t = ArgTemplater::with_connector(FakeConnector {
            refuse: Some(PathBuf::from("/missing")),
            ..FakeConnector::default()
        });
        let res = t.apply(r#"fd={{fd_connect "/missing"}}"#);
        assert!(matches!(res, Err(DriverError::FdConnect { .. })));
    }

    #[test]
    fn apply_all_parses_everything_before_connecting() {
        let mut t = templater();
        let args = [r#"fd={{fd_connect "/ok"}}"#, "{{ broken"];
        let res = t.apply_all(&args);
        assert!(matches!(res, Err(DriverError::Template { .. })));
        assert!(
            t.connector.opened.is_empty(),
            "no socket may be opened when a later argument is malformed"
        );
    }

    #[test]
    fn unix_connector_reports_missing_socket() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let mut t = ArgTemplater::new();
        let arg = format!("{{{{fd_connect \"{}\"}}}}", dir.path().join("absent.sock").display());
        let res = t.apply(&arg);
        assert!(matches!(res, Err(DriverError::FdConnect { .. })), "got {res:?}");
    }

    proptest::proptest! {
        #[test]
        fn proptest_plain_input_is_identity(arg in "[^{]*") {
            let mut t = templater();
            let out = t.apply(&arg);
            proptest::prop_assert_eq!(out.ok(), Some(arg.clone()));
            proptest::prop_assert!(t.files().is_empty());
        }

        #[test]
        fn proptest_indices_follow_argument_order(n in 1usize..16) {
            let mut t = templater();
            let args: Vec<String> = (0..n)
                .map(|i| format!("socket,fd={{{{ fd_connect \"/s/{i}\" }}}}"))
                .collect();
            let out = match t.apply_all(&args) {
                Ok(out) => out,
                Err(e) => return Err(proptest::test_runner::TestCaseError::fail(e.to_string())),
            };
            for (i, arg) in out.iter().enumerate() {
                proptest::prop_assert_eq!(arg, &format!("socket,fd={}", i + FIRST_INHERITED_FD));
            }
            proptest::prop_assert_eq!(t.files().len(), n);
        }

        #[test]
        fn proptest_parse_never_panics(arg in ".*") {
            let _ = parse(&arg);
        }
    }
}
