//! Condition expression tree
//!
//! Conditions are built as a boolean tree of claim comparisons and only
//! rendered to the IAM condition language at the output boundary.

use std::fmt;

/// Token claims the compiler knows how to reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Claim {
    Repository,
    Ref,
    Actor,
    JobWorkflowRef,
}

impl Claim {
    pub fn as_str(&self) -> &'static str {
        match self {
            Claim::Repository => "repository",
            Claim::Ref => "ref",
            Claim::Actor => "actor",
            Claim::JobWorkflowRef => "job_workflow_ref",
        }
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a condition expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `claim == 'value'`
    Equals(Claim, String),
    /// `claim.startsWith('prefix')`
    StartsWith(Claim, String),
    /// `has(claim)`
    Has(Claim),
    /// Conjunction of all children
    All(Vec<Expr>),
    /// Disjunction of all children
    Any(Vec<Expr>),
}

impl Expr {
    pub fn equals(claim: Claim, value: impl Into<String>) -> Self {
        Expr::Equals(claim, value.into())
    }

    pub fn starts_with(claim: Claim, prefix: impl Into<String>) -> Self {
        Expr::StartsWith(claim, prefix.into())
    }

    /// Conjunction, collapsing a single child into itself
    pub fn all(mut children: Vec<Expr>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Expr::All(children)
        }
    }

    /// Disjunction, collapsing a single child into itself
    pub fn any(mut children: Vec<Expr>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Expr::Any(children)
        }
    }

    /// True if a comparison against `claim` appears anywhere in the tree
    pub fn references(&self, claim: Claim) -> bool {
        match self {
            Expr::Equals(c, _) | Expr::StartsWith(c, _) | Expr::Has(c) => *c == claim,
            Expr::All(children) | Expr::Any(children) => {
                children.iter().any(|child| child.references(claim))
            }
        }
    }

    /// Render to the IAM condition language
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Expr::Equals(claim, value) => {
                out.push_str(claim.as_str());
                out.push_str(" == ");
                push_quoted(out, value);
            }
            Expr::StartsWith(claim, prefix) => {
                out.push_str(claim.as_str());
                out.push_str(".startsWith(");
                push_quoted(out, prefix);
                out.push(')');
            }
            Expr::Has(claim) => {
                out.push_str("has(");
                out.push_str(claim.as_str());
                out.push(')');
            }
            Expr::All(children) => write_joined(out, children, " && ", "true"),
            Expr::Any(children) => write_joined(out, children, " || ", "false"),
        }
    }

    fn is_compound(&self) -> bool {
        matches!(self, Expr::All(c) | Expr::Any(c) if c.len() > 1)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn write_joined(out: &mut String, children: &[Expr], separator: &str, empty: &str) {
    if children.is_empty() {
        out.push_str(empty);
        return;
    }
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        if child.is_compound() {
            out.push('(');
            child.write_to(out);
            out.push(')');
        } else {
            child.write_to(out);
        }
    }
}

fn push_quoted(out: &mut String, value: &str) {
    out.push('\'');
    out.push_str(value);
    out.push('\'');
}
