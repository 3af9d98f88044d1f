//! Decoded SWANK protocol frames.

use crate::sexpr::{Sexpr, SexprError};

/// Why a frame's text could not become a [`WireMessage`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed S-expression: {0}")]
    Syntax(#[from] SexprError),
    #[error("frame is not a list headed by a symbol")]
    MissingType,
}

/// One decoded protocol frame: `(:message-type arg...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    payload: Sexpr,
    raw: String,
}

/// Status half of a `(:return <status> <id>)` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnStatus {
    /// `(:ok <value>)`
    Ok(Sexpr),
    /// `(:abort <reason>)`; the reason is absent in older servers.
    Abort(Option<Sexpr>),
}

/// Debugger entry announced by `(:debug thread level condition restarts frames conts)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEntry {
    pub thread: Sexpr,
    pub level: i64,
    /// Printed condition lines, e.g. `["The variable QWE is unbound.", "[Condition of type UNBOUND-VARIABLE]"]`.
    pub condition: Vec<String>,
    /// `(name description)` pairs in the order the server offers them.
    pub restarts: Vec<(String, String)>,
}

impl WireMessage {
    /// Parse the text of one frame.
    pub fn parse(raw: impl Into<String>) -> Result<Self, MessageError> {
        let raw = raw.into();
        let payload = Sexpr::parse(&raw)?;
        let has_type = payload
            .as_list()
            .and_then(<[Sexpr]>::first)
            .is_some_and(|head| head.as_symbol().is_some());
        if !has_type {
            return Err(MessageError::MissingType);
        }
        Ok(Self { payload, raw })
    }

    #[must_use]
    pub fn payload(&self) -> &Sexpr {
        &self.payload
    }

    /// The frame as received, for logging.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// All elements, head included.
    #[must_use]
    pub fn elements(&self) -> &[Sexpr] {
        self.payload.as_list().unwrap_or_default()
    }

    /// Head symbol, e.g. `:return`.
    #[must_use]
    pub fn message_type(&self) -> &str {
        self.elements()
            .first()
            .and_then(Sexpr::as_symbol)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is(&self, message_type: &str) -> bool {
        self.message_type().eq_ignore_ascii_case(message_type)
    }

    #[must_use]
    pub fn last(&self) -> Option<&Sexpr> {
        self.elements().last()
    }

    /// Correlation id carried as the trailing element of a `:return`.
    #[must_use]
    pub fn return_id(&self) -> Option<u64> {
        if !self.is(":return") {
            return None;
        }
        self.last()
            .and_then(Sexpr::as_int)
            .and_then(|id| u64::try_from(id).ok())
    }

    #[must_use]
    pub fn return_status(&self) -> Option<ReturnStatus> {
        if !self.is(":return") {
            return None;
        }
        let status = self.elements().get(1)?.as_list()?;
        let (head, rest) = status.split_first()?;
        if head.is_symbol(":ok") {
            Some(ReturnStatus::Ok(rest.first().cloned().unwrap_or(Sexpr::symbol("nil"))))
        } else if head.is_symbol(":abort") {
            Some(ReturnStatus::Abort(rest.first().cloned()))
        } else {
            None
        }
    }

    /// Text of a `:write-string`, whatever its shape.
    #[must_use]
    pub fn write_string_text(&self) -> Option<&str> {
        if !self.is(":write-string") {
            return None;
        }
        self.elements().get(1).and_then(Sexpr::as_str)
    }

    /// Token of a `(:write-string "text" nil <token>)` that the server
    /// expects a `:write-done` for.
    #[must_use]
    pub fn write_token(&self) -> Option<i64> {
        if !self.is(":write-string") {
            return None;
        }
        match self.elements() {
            [head, Sexpr::Str(_), target, Sexpr::Int(token)]
                if head.as_symbol().is_some() && target.is_nil() =>
            {
                Some(*token)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn debug_entry(&self) -> Option<DebugEntry> {
        if !self.is(":debug") {
            return None;
        }
        let elements = self.elements();
        let thread = elements.get(1)?.clone();
        let level = elements.get(2)?.as_int()?;
        let condition = elements
            .get(3)
            .and_then(Sexpr::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Sexpr::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let restarts = elements
            .get(4)
            .and_then(Sexpr::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|restart| match restart.as_list()? {
                        [name, description, ..] => Some((
                            name.as_str()?.to_string(),
                            description.as_str()?.to_string(),
                        )),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(DebugEntry {
            thread,
            level,
            condition,
            restarts,
        })
    }
}
