// SPDX-License-Identifier: MIT

//! Request and response message types.

use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Exit code reported when no compiler is registered for the requested
/// language. The response carries empty output in that case.
pub const UNKNOWN_LANGUAGE_EXIT_CODE: i32 = -1;

/// Kind tag carried by every request argument on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ArgumentKind {
    /// An ordinary compiler command-line argument.
    CommandLine = 0,
    /// Keep-alive override: the value is a positive integer number of
    /// seconds the server should stay alive while idle.
    KeepAlive = 1,
    /// The client asks the server to shut down. The value is ignored.
    Shutdown = 2,
}

/// One tagged argument of a [`RunRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub kind: ArgumentKind,
    pub value: String,
}

impl Argument {
    pub fn command_line(value: impl Into<String>) -> Self {
        Self {
            kind: ArgumentKind::CommandLine,
            value: value.into(),
        }
    }

    pub fn keep_alive(seconds: u64) -> Self {
        Self {
            kind: ArgumentKind::KeepAlive,
            value: seconds.to_string(),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            kind: ArgumentKind::Shutdown,
            value: String::new(),
        }
    }
}

/// A single compilation request, decoded from the wire once per accepted
/// connection and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Identifies the compiler front end, e.g. `"rustc"`.
    pub language: String,
    /// Directory the compilation should resolve relative paths against.
    pub working_directory: String,
    /// Library search directory handed through to the compiler.
    pub lib_directory: String,
    /// Ordered argument list; order of `CommandLine` arguments is the
    /// command line the compiler sees.
    pub arguments: Vec<Argument>,
}

impl RunRequest {
    /// The keep-alive override requested by the client, if any.
    ///
    /// The first `KeepAlive` argument whose value parses as a positive
    /// integer wins; unparseable values are ignored.
    pub fn keep_alive_override(&self) -> Option<Duration> {
        self.arguments
            .iter()
            .filter(|arg| arg.kind == ArgumentKind::KeepAlive)
            .find_map(|arg| arg.value.parse::<u64>().ok().filter(|&secs| secs > 0))
            .map(Duration::from_secs)
    }

    /// Whether the client is asking the server to shut down rather than
    /// compile anything.
    pub fn is_shutdown_request(&self) -> bool {
        self.arguments
            .iter()
            .any(|arg| arg.kind == ArgumentKind::Shutdown)
    }

    /// The ordinary command-line arguments, in order.
    pub fn command_line_arguments(&self) -> impl Iterator<Item = &str> {
        self.arguments
            .iter()
            .filter(|arg| arg.kind == ArgumentKind::CommandLine)
            .map(|arg| arg.value.as_str())
    }
}

/// Wire tag of a [`BuildResponse`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ResponseTag {
    Completed = 0,
    AnalyzerInconsistency = 1,
    Shutdown = 2,
}

/// The result of a compilation that actually ran (or was refused because the
/// language is unknown, reported as exit code −1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedResponse {
    pub exit_code: i32,
    /// Whether the client should interpret the output as UTF-8.
    pub utf8_output: bool,
    pub output: String,
    pub error_output: String,
}

/// The single response written back on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResponse {
    /// The compiler ran (or the language was unknown); diagnostics and exit
    /// code are inside.
    Completed(CompletedResponse),
    /// The request's analyzer set could not be loaded consistently; no
    /// compiler was run.
    AnalyzerInconsistency { messages: Vec<String> },
    /// Acknowledges a shutdown request with the server's process id.
    Shutdown { server_pid: u32 },
}

impl BuildResponse {
    /// Sentinel response for a request naming a language no registered
    /// compiler handles.
    pub fn unknown_language() -> Self {
        Self::Completed(CompletedResponse {
            exit_code: UNKNOWN_LANGUAGE_EXIT_CODE,
            utf8_output: false,
            output: String::new(),
            error_output: String::new(),
        })
    }

    pub fn tag(&self) -> ResponseTag {
        match self {
            Self::Completed(_) => ResponseTag::Completed,
            Self::AnalyzerInconsistency { .. } => ResponseTag::AnalyzerInconsistency,
            Self::Shutdown { .. } => ResponseTag::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_override_picks_first_parseable() {
        let request = RunRequest {
            language: "rustc".into(),
            working_directory: "/src".into(),
            lib_directory: String::new(),
            arguments: vec![
                Argument::command_line("--edition=2024"),
                Argument {
                    kind: ArgumentKind::KeepAlive,
                    value: "not-a-number".into(),
                },
                Argument::keep_alive(90),
                Argument::keep_alive(5),
            ],
        };
        assert_eq!(request.keep_alive_override(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn zero_keep_alive_is_ignored() {
        let request = RunRequest {
            language: "rustc".into(),
            working_directory: String::new(),
            lib_directory: String::new(),
            arguments: vec![Argument::keep_alive(0)],
        };
        assert_eq!(request.keep_alive_override(), None);
    }

    #[test]
    fn command_line_arguments_skip_reserved_kinds() {
        let request = RunRequest {
            language: "rustc".into(),
            working_directory: String::new(),
            lib_directory: String::new(),
            arguments: vec![
                Argument::command_line("a.rs"),
                Argument::keep_alive(10),
                Argument::command_line("-O"),
            ],
        };
        let args: Vec<_> = request.command_line_arguments().collect();
        assert_eq!(args, vec!["a.rs", "-O"]);
        assert!(!request.is_shutdown_request());
    }
}
