//! The rules side of the agent: where the operating mode and the rule files
//! come from, and how a project file is checked and fixed.
//!
//! The remediation core only sees the [`RuleSource`] and [`RuleEngine`]
//! traits; rule semantics live behind [`RuleCheck`] implementations keyed by
//! [`RuleId`].

pub mod checks;
pub mod engine;
pub mod source;

pub use checks::{EncodingDeclaration, HeaderComment};
pub use engine::{BuiltinEngine, ComplianceReport, FixPlan, Issue, RuleCheck, RuleEngine, RuleId, RuleSet};
pub use source::{ProjectVars, ProjectVarsSource, RuleSource, StaticRuleSource};
