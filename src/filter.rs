//! Compiling filter specifications and testing lines against them.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task;

use futures_util::ready;
use futures_util::stream::Stream as FuturesStream;
use pin_project_lite::pin_project;
use regex::Regex;

use crate::cache::PatternCache;
use crate::error::{Error, Result};
use crate::expr::FilterExpr;
use crate::reader::Line;

/// What a line has to satisfy to be let through.
///
/// An empty spec lets everything through.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilterSpec {
    /// Plain, case-sensitive substrings that must all be present.
    pub substrings: Vec<String>,
    /// Regex sources that must all match.
    pub patterns: Vec<String>,
    pub expression: Option<FilterExpr>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_substring(mut self, substring: impl Into<String>) -> Self {
        self.substrings.push(substring.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn with_expression(mut self, expression: FilterExpr) -> Self {
        self.expression = Some(expression);
        self
    }

    /// Parses `expression` with [`FilterExpr::parse`]. An empty string leaves
    /// the spec without an expression.
    pub fn with_expression_str(self, expression: &str) -> Result<Self> {
        if expression.trim().is_empty() {
            return Ok(self);
        }
        Ok(self.with_expression(FilterExpr::parse(expression)?))
    }

    pub fn is_empty(&self) -> bool {
        self.substrings.is_empty() && self.patterns.is_empty() && self.expression.is_none()
    }
}

/// The string predicates an expression can call.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    /// Line contains the argument.
    Keyword,
    /// Line contains the argument, ignoring case.
    IKeyword,
    /// Line matches the argument as a regex.
    Match,
    /// Line matches the argument as a case-insensitive regex.
    IMatch,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Keyword, Method::IKeyword, Method::Match, Method::IMatch];

    pub fn from_name(name: &str) -> Option<Self> {
        Method::ALL.into_iter().find(|method| method.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Keyword => "keyword",
            Method::IKeyword => "ikeyword",
            Method::Match => "match",
            Method::IMatch => "imatch",
        }
    }

    /// The cache key for regex-backed methods.
    fn pattern(&self, argument: &str) -> Option<String> {
        match self {
            Method::Keyword | Method::IKeyword => None,
            Method::Match => Some(argument.to_string()),
            Method::IMatch => Some(format!("(?i){}", argument)),
        }
    }

}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A [`FilterExpr`] with every predicate resolved to what it tests, so
/// evaluating a line does no lookups and no allocation beyond `ikeyword`'s
/// lowercasing.
#[derive(Debug)]
enum Node {
    Literal(bool),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Keyword(String),
    /// Already lowercased.
    IKeyword(String),
    /// `match` and `imatch`, the latter compiled with `(?i)`.
    Pattern(Regex),
}

impl Node {
    fn compile(expression: &FilterExpr, cache: &PatternCache) -> Result<Node> {
        Ok(match expression {
            FilterExpr::Literal(value) => Node::Literal(*value),
            FilterExpr::Not(inner) => Node::Not(Box::new(Node::compile(inner, cache)?)),
            FilterExpr::And(lhs, rhs) => Node::And(
                Box::new(Node::compile(lhs, cache)?),
                Box::new(Node::compile(rhs, cache)?),
            ),
            FilterExpr::Or(lhs, rhs) => Node::Or(
                Box::new(Node::compile(lhs, cache)?),
                Box::new(Node::compile(rhs, cache)?),
            ),
            FilterExpr::Predicate { method, argument } => {
                let method =
                    Method::from_name(method).ok_or_else(|| Error::UnknownMethod(method.clone()))?;
                match method.pattern(argument) {
                    Some(pattern) => match cache.get_or_compile(&pattern) {
                        Ok(re) => Node::Pattern(re),
                        Err(source) => return Err(Error::Pattern { pattern, source }),
                    },
                    None if method == Method::IKeyword => Node::IKeyword(argument.to_lowercase()),
                    None => Node::Keyword(argument.clone()),
                }
            }
        })
    }

    fn eval(&self, text: &str) -> bool {
        match self {
            Node::Literal(value) => *value,
            Node::Not(inner) => !inner.eval(text),
            Node::And(lhs, rhs) => lhs.eval(text) && rhs.eval(text),
            Node::Or(lhs, rhs) => lhs.eval(text) || rhs.eval(text),
            Node::Keyword(needle) => text.contains(needle.as_str()),
            Node::IKeyword(needle) => text.to_lowercase().contains(needle.as_str()),
            Node::Pattern(re) => re.is_match(text),
        }
    }
}

#[derive(Debug)]
struct CompiledExpr {
    source: FilterExpr,
    root: Node,
}

/// A compiled [`FilterSpec`], ready to test lines.
///
/// Cloning is cheap and clones share one [`PatternCache`], so an evaluator
/// can be handed to several tasks.
#[derive(Clone)]
pub struct Evaluator {
    substrings: Arc<[String]>,
    patterns: Arc<[Regex]>,
    expression: Option<Arc<CompiledExpr>>,
    cache: Arc<PatternCache>,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("substrings", &self.substrings)
            .field(
                "patterns",
                &self.patterns.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .field(
                "expression",
                &self.expression.as_ref().map(|e| e.source.to_string()),
            )
            .field("cached_patterns", &self.cache.len())
            .finish()
    }
}

impl Evaluator {
    /// Compiles `spec` with a fresh pattern cache.
    pub fn compile(spec: FilterSpec) -> Result<Self> {
        Self::compile_with_cache(spec, Arc::new(PatternCache::new()))
    }

    /// Compiles `spec`, resolving expression patterns through `cache`.
    ///
    /// Every regex, whether listed in the spec or used by `match`/`imatch`,
    /// is compiled here, and every predicate name is resolved, so a bad
    /// filter is rejected before any line is read.
    pub fn compile_with_cache(spec: FilterSpec, cache: Arc<PatternCache>) -> Result<Self> {
        let FilterSpec {
            substrings,
            patterns,
            expression,
        } = spec;

        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| Error::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let expression = expression
            .map(|source| {
                let root = Node::compile(&source, &cache)?;
                Ok::<_, Error>(Arc::new(CompiledExpr { source, root }))
            })
            .transpose()?;

        tracing::debug!(
            substrings = substrings.len(),
            patterns = patterns.len(),
            expression = ?expression.as_ref().map(|e| e.source.to_string()),
            "compiled filter"
        );

        Ok(Evaluator {
            substrings: substrings.into(),
            patterns: patterns.into(),
            expression,
            cache,
        })
    }

    pub fn cache(&self) -> &Arc<PatternCache> {
        &self.cache
    }

    /// Whether `line` passes the filter.
    pub fn test(&self, line: &Line) -> bool {
        self.matches(line.line())
    }

    /// Whether `text` passes the filter.
    ///
    /// Substrings are checked first, then patterns, then the expression,
    /// stopping at the first failure.
    pub fn matches(&self, text: &str) -> bool {
        if !self.substrings.iter().all(|s| text.contains(s.as_str())) {
            return false;
        }
        if !self.patterns.iter().all(|re| re.is_match(text)) {
            return false;
        }

        self.expression
            .as_ref()
            .map_or(true, |expression| expression.root.eval(text))
    }

    /// Wraps a line stream so that only passing lines come out.
    pub fn filter<S>(self, lines: S) -> FilteredLines<S>
    where
        S: FuturesStream<Item = Line>,
    {
        FilteredLines {
            lines,
            evaluator: self,
        }
    }
}

pin_project! {
/// Stream adapter returned by [`Evaluator::filter`].
#[derive(Debug)]
pub struct FilteredLines<S> {
    #[pin]
    lines: S,
    evaluator: Evaluator,
}
}

impl<S> FilteredLines<S> {
    pub fn get_ref(&self) -> &S {
        &self.lines
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.lines
    }

    pub fn into_inner(self) -> S {
        self.lines
    }
}

impl<S> FuturesStream for FilteredLines<S>
where
    S: FuturesStream<Item = Line>,
{
    type Item = Line;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match ready!(this.lines.as_mut().poll_next(cx)) {
                Some(line) => {
                    if this.evaluator.test(&line) {
                        return task::Poll::Ready(Some(line));
                    }
                }
                None => return task::Poll::Ready(None),
            }
        }
    }
}
