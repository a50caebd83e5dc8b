use regex::Regex;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, LazyLock};
use tracing_subscriber::fmt::MakeWriter;

#[allow(clippy::expect_used)]
static PATTERNS: LazyLock<ScrubPatterns> = LazyLock::new(|| ScrubPatterns {
    // OpenAI-style and Anthropic-style secret keys: sk-..., sk-proj-..., sk-ant-...
    api_key: Regex::new(r"sk-[a-zA-Z0-9_-]{16,}").expect("api key regex is valid"),
    // Bearer tokens in Authorization headers
    bearer: Regex::new(r"Bearer\s+[a-zA-Z0-9\-_\.=]+").expect("bearer regex is valid"),
    // api_key / token / secret fields in JSON or key=value form
    field: Regex::new(
        r#"(?i)(["']?(?:api_key|apikey|token|secret)["']?\s*[:=]\s*)["']?[a-zA-Z0-9\-_\.]{8,}["']?"#,
    )
    .expect("field regex is valid"),
    // password fields
    password: Regex::new(r#"(?i)(["']?password["']?\s*[:=]\s*)["']?[^"'\s,}]+["']?"#)
        .expect("password regex is valid"),
});

struct ScrubPatterns {
    api_key: Regex,
    bearer: Regex,
    field: Regex,
    password: Regex,
}

/// Redacts credentials from log text
#[derive(Clone, Copy, Default)]
pub struct SecretScrubber;

impl SecretScrubber {
    pub const fn new() -> Self {
        Self
    }

    /// Scrub a message of sensitive data
    pub fn scrub_message(&self, message: &str) -> String {
        let scrubbed = PATTERNS.bearer.replace_all(message, "Bearer [TOKEN_REDACTED]");
        let scrubbed = PATTERNS.field.replace_all(&scrubbed, "${1}[REDACTED]");
        let scrubbed = PATTERNS.password.replace_all(&scrubbed, "${1}[REDACTED]");
        PATTERNS
            .api_key
            .replace_all(&scrubbed, "[API_KEY_REDACTED]")
            .into_owned()
    }
}

impl fmt::Debug for SecretScrubber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretScrubber").finish()
    }
}

/// `MakeWriter` that scrubs every formatted event before it reaches the sink.
///
/// The fmt layer renders each event into a buffer and hands it over in a
/// single write, so scrubbing per write sees whole lines.
#[derive(Clone)]
pub struct ScrubbingMakeWriter<M> {
    inner: M,
    scrubber: Arc<SecretScrubber>,
}

impl<M> ScrubbingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            scrubber: Arc::new(SecretScrubber::new()),
        }
    }
}

impl<'a, M> MakeWriter<'a> for ScrubbingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = ScrubbingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        ScrubbingWriter {
            inner: self.inner.make_writer(),
            scrubber: Arc::clone(&self.scrubber),
        }
    }
}

/// Writer half of [`ScrubbingMakeWriter`].
pub struct ScrubbingWriter<W> {
    inner: W,
    scrubber: Arc<SecretScrubber>,
}

impl<W: Write> Write for ScrubbingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner
            .write_all(self.scrubber.scrub_message(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
