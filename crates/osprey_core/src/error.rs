use crate::ast::Id;
use crate::diagnostics::Span;

/// Fatal backend errors. Everything here halts compilation; the primitive
/// analyzer's "unsupported combination" case is deliberately absent because
/// the analyzer declines instead of failing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{span}: no runtime representation for type: {detail}")]
    TypeLowering { span: Span, detail: String },

    #[error("{span}: definition of `{id}` binds {found} parameters but its type has {expected}")]
    ArityMismatch {
        span: Span,
        id: Id,
        expected: usize,
        found: usize,
    },

    #[error("constructor `{ctor}` of `{variant}` is still polymorphic after specialization ({ctyp})")]
    PolymorphismLeak { variant: Id, ctor: Id, ctyp: String },

    #[error("cycle through the definition of type `{id}`")]
    TypeCycle { id: Id },

    /// A rewriter reached an instruction shape it does not understand. Always
    /// a backend bug, never a user error.
    #[error("internal invariant violated in {pass}: {detail}")]
    Invariant { pass: &'static str, detail: String },
}

impl Error {
    /// The source span the error points at, when it carries one.
    pub fn span(&self) -> Option<Span> {
        match self {
            Error::TypeLowering { span, .. } | Error::ArityMismatch { span, .. } => Some(*span),
            _ => None,
        }
    }

    /// Render through the diagnostics machinery, with a caret frame when the
    /// source text is available.
    pub fn render(&self, path: &str, source: Option<&str>, use_color: bool) -> String {
        crate::diagnostics::render_error(
            path,
            self.span().unwrap_or_else(Span::unknown),
            &self.to_string(),
            source,
            use_color,
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_errors_carry_the_span() {
        let err = Error::TypeLowering {
            span: Span::new(3, 5, 3, 9),
            detail: "unknown type `frob`".to_string(),
        };
        let rendered = err.render("cpu.spec", None, false);
        assert!(rendered.contains("cpu.spec:3:5"));
        assert!(rendered.contains("unknown type `frob`"));
    }
}

