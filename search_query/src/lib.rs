//! The search query AST and its traversal.
//!
//! A query is a list of [`Node`]s: scoping parameters (`repo:foo`) and
//! pattern expressions combined with `and`/`or`/`concat` operators.
//! Traversal is plain recursion over the tagged variants with closures
//! supplying the behavior ([`visit_parameters`], [`map_parameters`],
//! [`fold`]) rather than a visitor object hierarchy.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;
use std::fmt;

/// How an operator combines its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    /// Every operand must match.
    And,
    /// Any operand may match.
    Or,
    /// Operands are adjacent pattern fragments.
    Concat,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Concat => "concat",
        };
        f.write_str(name)
    }
}

/// A node of the query AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A `field:value` scoping parameter. An empty field denotes a bare
    /// search pattern.
    Parameter {
        /// The field name, e.g. `repo`. Empty for search patterns.
        field: String,
        /// The field value or pattern text.
        value: String,
        /// Whether the parameter was negated (`-repo:foo`).
        negated: bool,
    },
    /// An operator over sub-queries.
    Operator {
        /// How the operands combine.
        kind: OperatorKind,
        /// The sub-queries, in source order.
        operands: Vec<Node>,
    },
}

impl Node {
    /// Convenience constructor for a parameter node.
    pub fn parameter(field: impl Into<String>, value: impl Into<String>, negated: bool) -> Self {
        Self::Parameter {
            field: field.into(),
            value: value.into(),
            negated,
        }
    }
}

impl fmt::Display for Node {
    /// Renders the canonical s-expression form, e.g.
    /// `(and "repo:foo" "PATTERN")`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter {
                field,
                value,
                negated,
            } => {
                if field.is_empty() {
                    write!(f, "{:?}", value)
                } else if *negated {
                    write!(f, "\"-{}:{}\"", field, value)
                } else {
                    write!(f, "\"{}:{}\"", field, value)
                }
            }
            Self::Operator { kind, operands } => {
                write!(f, "({}", kind)?;
                for operand in operands {
                    write!(f, " {}", operand)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Call `f` on every node, depth first, operators before their operands.
pub fn visit(nodes: &[Node], f: &mut impl FnMut(&Node)) {
    for node in nodes {
        f(node);
        if let Node::Operator { operands, .. } = node {
            visit(operands, f);
        }
    }
}

/// Call `f` with the field, value and negation of every parameter node.
pub fn visit_parameters(nodes: &[Node], f: &mut impl FnMut(&str, &str, bool)) {
    visit(nodes, &mut |node| {
        if let Node::Parameter {
            field,
            value,
            negated,
        } = node
        {
            f(field, value, *negated)
        }
    })
}

/// Call `f` with the kind and operands of every operator node.
pub fn visit_operators(nodes: &[Node], f: &mut impl FnMut(OperatorKind, &[Node])) {
    visit(nodes, &mut |node| {
        if let Node::Operator { kind, operands } = node {
            f(*kind, operands)
        }
    })
}

/// Call `f` with the value and negation of every parameter node whose field
/// equals `field`.
pub fn visit_field(nodes: &[Node], field: &str, f: &mut impl FnMut(&str, bool)) {
    visit_parameters(nodes, &mut |node_field, value, negated| {
        if node_field == field {
            f(value, negated)
        }
    })
}

/// Fold `f` over every node, depth first, threading an accumulator.
pub fn fold<A>(nodes: &[Node], init: A, f: &mut impl FnMut(A, &Node) -> A) -> A {
    let mut acc = init;
    for node in nodes {
        acc = f(acc, node);
        if let Node::Operator { operands, .. } = node {
            acc = fold(operands, acc, f);
        }
    }
    acc
}

/// Rebuild the query, replacing every parameter node with `f`'s result.
/// Operators are preserved and reduced through [`new_operator`].
pub fn map_parameters(
    nodes: Vec<Node>,
    f: &mut impl FnMut(String, String, bool) -> Node,
) -> Vec<Node> {
    let mut mapped = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Parameter {
                field,
                value,
                negated,
            } => mapped.push(f(field, value, negated)),
            Node::Operator { kind, operands } => {
                mapped.extend(new_operator(map_parameters(operands, f), kind))
            }
        }
    }
    mapped
}

/// Wrap `operands` in an operator node, reducing trivial shapes: a single
/// operand needs no operator and an empty operand list vanishes.
pub fn new_operator(operands: Vec<Node>, kind: OperatorKind) -> Vec<Node> {
    match operands.len() {
        0 => Vec::new(),
        1 => operands,
        _ => vec![Node::Operator { kind, operands }],
    }
}

/// Lowercase every parameter field name, so `rEpO:foo` scopes like
/// `repo:foo`.
pub fn lowercase_field_names(nodes: Vec<Node>) -> Vec<Node> {
    map_parameters(nodes, &mut |field, value, negated| Node::Parameter {
        field: field.to_lowercase(),
        value,
        negated,
    })
}

/// Validation failures when partitioning a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum Error {
    /// The query mixes scope parameters into a pattern expression in a way
    /// that cannot be evaluated.
    #[snafu(display("cannot evaluate: unable to partition pure search pattern"))]
    UnpartitionableSearchPattern,
}

/// Whether every leaf under `nodes` is a search pattern (an empty or
/// `content` field).
pub fn is_pattern_expression(nodes: &[Node]) -> bool {
    let mut result = true;
    visit_parameters(nodes, &mut |field, _, _| {
        if !field.is_empty() && field != "content" {
            result = false;
        }
    });
    result
}

/// Partition a query into its scope parameters and a single pattern
/// expression.
///
/// Scope parameters (e.g. `repo:`, `file:`) restrict where patterns are
/// evaluated and must not contain nested expressions; all pattern
/// expressions collapse into one (joined with `and` when there are
/// several). Queries that cannot be split this way are rejected.
pub fn partition_search_pattern(nodes: Vec<Node>) -> Result<(Vec<Node>, Option<Node>), Error> {
    let nodes = if nodes.len() == 1 {
        match nodes.into_iter().next() {
            Some(node) => process_top_level(node)?,
            None => Vec::new(),
        }
    } else {
        nodes
    };

    let mut parameters = Vec::new();
    let mut patterns = Vec::new();
    for node in nodes {
        if is_pattern_expression(std::slice::from_ref(&node)) {
            patterns.push(node);
        } else if matches!(node, Node::Parameter { .. }) {
            parameters.push(node);
        } else {
            return UnpartitionableSearchPatternSnafu.fail();
        }
    }

    let pattern = if patterns.len() > 1 {
        Some(Node::Operator {
            kind: OperatorKind::And,
            operands: patterns,
        })
    } else {
        patterns.pop()
    };

    Ok((parameters, pattern))
}

/// Unwrap the top level of a single-node query: a pure pattern expression
/// passes through whole, a scoping `and` contributes its operands, and a
/// top-level `or` over mixed parameters cannot be partitioned.
fn process_top_level(node: Node) -> Result<Vec<Node>, Error> {
    let pure_pattern = is_pattern_expression(std::slice::from_ref(&node));
    match node {
        node @ Node::Operator {
            kind: OperatorKind::And | OperatorKind::Or,
            ..
        } if pure_pattern => Ok(vec![node]),
        Node::Operator {
            kind: OperatorKind::And,
            operands,
        } => Ok(operands),
        node @ Node::Operator {
            kind: OperatorKind::Concat,
            ..
        } => Ok(vec![node]),
        Node::Operator { .. } => UnpartitionableSearchPatternSnafu.fail(),
        node @ Node::Parameter { .. } => Ok(vec![node]),
    }
}
