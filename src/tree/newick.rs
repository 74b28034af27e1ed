//! Newick parsing and writing.
//!
//! Grounded in `pta/tree.rs`'s s-expression parser: a small
//! recursive-descent grammar built from `nom` combinators, the same
//! "recognize nested parens, recurse on each child" shape, retargeted from
//! `(s (a) (b))` s-expressions to standard Newick `(a,b)label:length;`.
//! Branch lengths present in the input are parsed and attached to each
//! node; `Tree::from_newick` still re-estimates every edge length from
//! scratch per §6, but `Tree::from_newick_with_lengths` (used only by
//! `--likelihood` mode) honors them.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::char,
    combinator::{map, opt},
    multi::separated_list1,
    number::complete::double,
    sequence::{pair, preceded, tuple},
    IResult,
};

use crate::error::{LamlError, Result};

#[derive(Debug, Clone)]
pub enum NewickNode {
    Leaf {
        label: String,
        length: Option<f64>,
    },
    Internal {
        label: Option<String>,
        children: Vec<NewickNode>,
        length: Option<f64>,
    },
}

impl NewickNode {
    fn with_length(self, len: Option<f64>) -> NewickNode {
        match self {
            NewickNode::Leaf { label, .. } => NewickNode::Leaf { label, length: len },
            NewickNode::Internal { label, children, .. } => {
                NewickNode::Internal { label, children, length: len }
            }
        }
    }
}

fn label(input: &str) -> IResult<&str, String> {
    map(is_not("(),:;"), |s: &str| s.to_string())(input)
}

fn branch_length(input: &str) -> IResult<&str, f64> {
    preceded(char(':'), double)(input)
}

fn leaf(input: &str) -> IResult<&str, NewickNode> {
    map(label, |label| NewickNode::Leaf { label, length: None })(input)
}

fn internal(input: &str) -> IResult<&str, NewickNode> {
    map(
        pair(
            preceded(
                char('('),
                separated_list1(char(','), node),
            ),
            preceded(char(')'), opt(label)),
        ),
        |(children, label)| NewickNode::Internal {
            label: label.filter(|s| !s.is_empty()),
            children,
            length: None,
        },
    )(input)
}

fn node(input: &str) -> IResult<&str, NewickNode> {
    map(
        pair(alt((internal, leaf)), opt(branch_length)),
        |(n, len)| n.with_length(len),
    )(input)
}

fn tree(input: &str) -> IResult<&str, NewickNode> {
    map(tuple((node, opt(char(';')))), |(n, _)| n)(input)
}

pub fn parse_newick(s: &str) -> Result<NewickNode> {
    let trimmed = s.trim();
    match tree(trimmed) {
        Ok((rest, n)) if rest.trim().is_empty() => Ok(n),
        Ok((rest, _)) => Err(LamlError::Newick(format!(
            "trailing input after tree: {rest:?}"
        ))),
        Err(e) => Err(LamlError::Newick(format!("{e}"))),
    }
}
