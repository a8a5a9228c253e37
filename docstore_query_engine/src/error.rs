// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{borrow::Cow, fmt::Display};

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Indicates that the caller supplied an invalid request: a continuation token that failed to
    /// parse, an unknown execution environment, or a malformed rewritten projection.
    ///
    /// The message carries the offending token or value so the caller can see what was rejected.
    BadRequest,

    /// Indicates that a partition returned data that violates the wire contract, such as an
    /// aggregate value with the wrong shape.
    ///
    /// This error is not recoverable and indicates a bug in the upstream query rewrite or the
    /// backing store.
    InvalidSourceResponse,

    /// Indicates that an aggregation produced a non-finite number.
    ArithmeticOverflow,

    /// Indicates an internal invariant violation in the query engine.
    ///
    /// This error is not recoverable, and indicates a bug in the engine. The query must fail with
    /// the attached message rather than produce partial results.
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::BadRequest => write!(f, "bad request"),
            ErrorKind::InvalidSourceResponse => write!(f, "invalid data received from partition"),
            ErrorKind::ArithmeticOverflow => write!(f, "arithmetic overflow during aggregation"),
            ErrorKind::InternalError => write!(f, "internal query engine error"),
        }
    }
}

impl ErrorKind {
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::from(self).with_source(source)
    }

    pub fn with_message(self, message: impl Into<Cow<'static, str>>) -> Error {
        Error::from(self).with_message(message)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: Option<Cow<'static, str>>,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            message: None,
        }
    }
}

impl Error {
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn into_source(self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.source
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}"),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_ref()?;
        Some(&**source)
    }
}
