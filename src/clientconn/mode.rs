//! Connection operation modes.

use std::fmt;
use std::str::FromStr;

use snafu::Snafu;

/// How the runner treats each request. Configured once at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Handle requests locally.
    #[default]
    Normal,
    /// Forward requests to the upstream and respond with its reply.
    Proxy,
    /// Handle locally *and* forward; log a diff; respond with the local
    /// reply.
    DiffNormal,
    /// Handle locally *and* forward; log a diff; respond with the upstream
    /// reply.
    DiffProxy,
}

/// All modes, the first one being the default.
pub const ALL_MODES: [Mode; 4] = [Mode::Normal, Mode::Proxy, Mode::DiffNormal, Mode::DiffProxy];

impl Mode {
    /// The configuration spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Proxy => "proxy",
            Mode::DiffNormal => "diff-normal",
            Mode::DiffProxy => "diff-proxy",
        }
    }

    /// Whether requests are mirrored to the upstream.
    pub fn proxies(self) -> bool {
        !matches!(self, Mode::Normal)
    }

    /// Whether requests are handled locally.
    pub fn handles(self) -> bool {
        !matches!(self, Mode::Proxy)
    }

    /// Whether the two responses are diffed.
    pub fn diffs(self) -> bool {
        matches!(self, Mode::DiffNormal | Mode::DiffProxy)
    }

    /// Whether the upstream reply is the one sent to the client.
    pub fn responds_from_proxy(self) -> bool {
        matches!(self, Mode::Proxy | Mode::DiffProxy)
    }
}

/// Error for an unrecognized mode spelling.
#[derive(Debug, Snafu)]
#[snafu(display("unknown mode {input:?}; expected one of normal, proxy, diff-normal, diff-proxy"))]
pub struct ParseModeError {
    input: String,
}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Mode::Normal),
            "proxy" => Ok(Mode::Proxy),
            "diff-normal" => Ok(Mode::DiffNormal),
            "diff-proxy" => Ok(Mode::DiffProxy),
            _ => Err(ParseModeError { input: s.to_owned() }),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
