use std::fmt;
use std::io;

use crate::env::Env;

//------------ Error ---------------------------------------------------------

/// A program error.
///
/// Such errors are highly likely to halt the program.
pub struct Error(Box<Information>);

/// Information about an error.
struct Information {
    /// What went wrong.
    primary: ErrorKind,

    /// Layers of context to the error.
    ///
    /// Ordered from innermost to outermost.
    context: Vec<Box<str>>,
}

/// The kinds of errors the program distinguishes.
#[derive(Debug)]
pub enum ErrorKind {
    /// Missing or inconsistent configuration options.
    Config(Box<str>),

    /// A read, write or rename failure.
    Io(Box<str>),

    /// A malformed input zone or key file.
    Parse(Box<str>),

    /// Key file decoding, HSM login or missing-key failures.
    Key(Box<str>),

    /// A PKCS#11 call failure, wrapping the CKR diagnostic.
    Hsm(Box<str>),

    /// An algorithm mismatch between a key and the requested algorithm.
    Sign(Box<str>),

    /// One or more verification failures.
    Verify(Box<str>),

    /// A command line parsing error, styled by clap itself.
    Clap(clap::Error),
}

impl ErrorKind {
    fn label(&self) -> &'static str {
        match self {
            ErrorKind::Config(_) => "config error",
            ErrorKind::Io(_) => "io error",
            ErrorKind::Parse(_) => "parse error",
            ErrorKind::Key(_) => "key error",
            ErrorKind::Hsm(_) => "hsm error",
            ErrorKind::Sign(_) => "sign error",
            ErrorKind::Verify(_) => "verify error",
            ErrorKind::Clap(_) => "argument error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Config(msg)
            | ErrorKind::Io(msg)
            | ErrorKind::Parse(msg)
            | ErrorKind::Key(msg)
            | ErrorKind::Hsm(msg)
            | ErrorKind::Sign(msg)
            | ErrorKind::Verify(msg) => {
                write!(f, "{}: {}", self.label(), msg)
            }
            ErrorKind::Clap(err) => err.fmt(f),
        }
    }
}

//--- Interaction

impl Error {
    fn new(kind: ErrorKind) -> Self {
        Self(Box::new(Information {
            primary: kind,
            context: Vec::new(),
        }))
    }

    pub fn config(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Config(msg.to_string().into()))
    }

    pub fn io(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Io(msg.to_string().into()))
    }

    pub fn parse(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Parse(msg.to_string().into()))
    }

    pub fn key(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Key(msg.to_string().into()))
    }

    pub fn hsm(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Hsm(msg.to_string().into()))
    }

    pub fn sign(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Sign(msg.to_string().into()))
    }

    pub fn verify(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Verify(msg.to_string().into()))
    }

    /// Add context to this error.
    pub fn context(mut self, context: &str) -> Self {
        self.0.context.push(context.into());
        self
    }

    /// Pretty-print this error.
    pub fn pretty_print(&self, env: impl Env) {
        let mut err = env.stderr();
        match &self.0.primary {
            // Clap errors are already styled, so we just print the string
            // clap produces and return. Context does not make sense for
            // command line arguments either.
            ErrorKind::Clap(e) => {
                writeln!(err, "{}", e.render().ansi());
            }
            primary => {
                writeln!(err, "[zonesign] error: {primary}");
                for context in &self.0.context {
                    writeln!(err, "... while {context}");
                }
            }
        }
    }

    pub fn exit_code(&self) -> u8 {
        // Clap uses the exit code 2 for usage errors and we want to keep
        // that, but we aren't actually returning the clap error, so we
        // replicate that behaviour here.
        if let ErrorKind::Clap(e) = &self.0.primary {
            e.exit_code() as u8
        } else {
            1
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.primary
    }
}

//--- Conversions for '?'

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::io(error)
    }
}

impl From<cryptoki::error::Error> for Error {
    fn from(error: cryptoki::error::Error) -> Self {
        Self::hsm(error)
    }
}

impl From<clap::Error> for Error {
    fn from(value: clap::Error) -> Self {
        Self::new(ErrorKind::Clap(value))
    }
}

//--- Display, Debug

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.primary.fmt(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("primary", &self.0.primary)
            .field("context", &self.0.context)
            .finish()
    }
}

impl std::error::Error for Error {}

//------------ Result --------------------------------------------------------

/// A program result.
pub type Result<T> = core::result::Result<T, Error>;

/// An extension trait for [`Result`]s using [`Error`].
pub trait Context: Sized {
    /// Add context for an error.
    fn context(self, context: &str) -> Self;

    /// Add context for an error, lazily.
    fn with_context(self, context: impl FnOnce() -> String) -> Self;
}

impl<T> Context for Result<T> {
    fn context(self, context: &str) -> Self {
        self.map_err(|err| err.context(context))
    }

    fn with_context(self, context: impl FnOnce() -> String) -> Self {
        self.map_err(|err| err.context(&(context)()))
    }
}
