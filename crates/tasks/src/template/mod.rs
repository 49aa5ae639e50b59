//! Template evaluator.
//!
//! String leaves are either minijinja text templates or, with the
//! `[[expr]]` prefix, minijinja expressions evaluated to typed values.

mod engine;

pub use engine::{is_template, Evaluator, TemplateLanguage, EXPRESSION_TAG};
