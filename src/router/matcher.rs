//! Segment-trie path matching.
//!
//! Each trie level holds literal children, at most one variable child, and
//! catch-all routes. Lookup tries them in that order and backtracks, so
//! `/strains/new` prefers a literal `new` over `$name`, but still falls
//! through to `$name` when the literal branch has no route deeper down.

use std::collections::HashMap;

use crate::context::PathParams;
use crate::router::{RoutePattern, Segment};

/// Why a pattern could not be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    /// The exact pattern is already taken by the given route.
    Duplicate { existing: usize },
    /// A variable with a different name, or a literal catch-all beside a
    /// variable, already occupies this level.
    VariableConflict { existing: String, new: String },
}

#[derive(Debug, Default)]
struct Node {
    route: Option<usize>,
    literals: HashMap<String, Node>,
    variable: Option<(String, Box<Node>)>,
    literal_catch_alls: HashMap<String, usize>,
    variable_catch_all: Option<(String, usize)>,
}

/// The result of a successful lookup: a route index and its bound parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found {
    pub route: usize,
    pub params: PathParams,
}

/// A segment trie mapping patterns to route indices.
#[derive(Debug, Default)]
pub struct Matcher {
    root: Node,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `pattern` for route `route`.
    ///
    /// A catch-all must be the last segment; anything after it is ignored.
    pub fn insert(&mut self, pattern: &RoutePattern, route: usize) -> Result<(), InsertError> {
        let mut node = &mut self.root;
        for segment in pattern.segments() {
            match segment {
                Segment::Literal(lit) => {
                    node = node.literals.entry(lit.clone()).or_default();
                }
                Segment::Variable(name) => {
                    check_no_literal_catch_all(node, name)?;
                    let slot = node
                        .variable
                        .get_or_insert_with(|| (name.clone(), Box::default()));
                    check_variable(&slot.0, name)?;
                    node = slot.1.as_mut();
                }
                Segment::LiteralCatchAll(lit) => {
                    let var = node
                        .variable
                        .as_ref()
                        .map(|(var, _)| var)
                        .or(node.variable_catch_all.as_ref().map(|(var, _)| var));
                    if let Some(var) = var {
                        return Err(InsertError::VariableConflict {
                            existing: var.clone(),
                            new: format!("{lit}+"),
                        });
                    }
                    return match node.literal_catch_alls.get(lit) {
                        Some(&existing) => Err(InsertError::Duplicate { existing }),
                        None => {
                            node.literal_catch_alls.insert(lit.clone(), route);
                            Ok(())
                        }
                    };
                }
                Segment::VariableCatchAll(name) => {
                    check_no_literal_catch_all(node, name)?;
                    if let Some((var, _)) = &node.variable {
                        check_variable(var, name)?;
                    }
                    return match &node.variable_catch_all {
                        Some((var, existing)) => {
                            check_variable(var, name)?;
                            Err(InsertError::Duplicate { existing: *existing })
                        }
                        None => {
                            node.variable_catch_all = Some((name.clone(), route));
                            Ok(())
                        }
                    };
                }
            }
        }
        match node.route {
            Some(existing) => Err(InsertError::Duplicate { existing }),
            None => {
                node.route = Some(route);
                Ok(())
            }
        }
    }

    /// Resolves `path`. Empty segments (including a trailing slash) are ignored.
    pub fn lookup(&self, path: &str) -> Option<Found> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut bound = Vec::new();
        let (route, rest) = find(&self.root, &segments, &mut bound)?;
        let mut params = PathParams::new();
        for (name, value) in bound {
            params.insert(name, value);
        }
        if let Some(rest) = rest {
            params.set_rest(rest);
        }
        Some(Found { route, params })
    }
}

fn check_variable(existing: &str, new: &str) -> Result<(), InsertError> {
    if existing == new {
        Ok(())
    } else {
        Err(InsertError::VariableConflict {
            existing: existing.to_owned(),
            new: new.to_owned(),
        })
    }
}

fn check_no_literal_catch_all(node: &Node, var: &str) -> Result<(), InsertError> {
    match node.literal_catch_alls.keys().next() {
        Some(lit) => Err(InsertError::VariableConflict {
            existing: format!("{lit}+"),
            new: var.to_owned(),
        }),
        None => Ok(()),
    }
}

fn find(node: &Node, segments: &[&str], bound: &mut Vec<(String, String)>) -> Option<(usize, Option<String>)> {
    let Some((head, tail)) = segments.split_first() else {
        return node.route.map(|route| (route, None));
    };

    if let Some(child) = node.literals.get(*head) {
        if let Some(found) = find(child, tail, bound) {
            return Some(found);
        }
    }

    if let Some((name, child)) = &node.variable {
        bound.push((name.clone(), (*head).to_owned()));
        if let Some(found) = find(child, tail, bound) {
            return Some(found);
        }
        bound.pop();
    }

    if let Some(&route) = node.literal_catch_alls.get(*head) {
        let rest = (!tail.is_empty()).then(|| tail.join("/"));
        return Some((route, rest));
    }

    if let Some((name, route)) = &node.variable_catch_all {
        let rest = segments.join("/");
        bound.push((name.clone(), rest.clone()));
        return Some((*route, Some(rest)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> Matcher {
        let mut m = Matcher::new();
        for (i, p) in patterns.iter().enumerate() {
            m.insert(&RoutePattern::parse(p), i).unwrap();
        }
        m
    }

    #[test]
    fn variable_binds_one_segment() {
        let m = matcher(&["/strains/$name/info"]);
        let found = m.lookup("/strains/gorillaGlue/info").unwrap();
        assert_eq!(found.params.get("name"), Some("gorillaGlue"));
        assert!(m.lookup("/strains/x/y/info").is_none());
        assert!(m.lookup("/strains/info").is_none());
    }

    #[test]
    fn literal_catch_all_matches_prefix_segments_only() {
        let m = matcher(&["/strains+"]);
        assert!(m.lookup("/strains").is_some());
        assert_eq!(m.lookup("/strains/a").unwrap().params.rest(), Some("a"));
        assert_eq!(
            m.lookup("/strains/a/b/c").unwrap().params.rest(),
            Some("a/b/c")
        );
        assert!(m.lookup("/strainsX").is_none());
        assert!(m.lookup("/").is_none());
    }

    #[test]
    fn variable_catch_all_needs_a_segment() {
        let m = matcher(&["/files/$path+"]);
        let found = m.lookup("/files/docs/readme.txt").unwrap();
        assert_eq!(found.params.get("path"), Some("docs/readme.txt"));
        assert!(m.lookup("/files").is_none());
    }

    #[test]
    fn literals_win_then_fall_back() {
        let m = matcher(&["/strains/new", "/strains/$name", "/strains/new/edit/$x"]);
        assert_eq!(m.lookup("/strains/new").unwrap().route, 0);
        assert_eq!(m.lookup("/strains/blueDream").unwrap().route, 1);
        // `new/edit` has no route, so `$name` is tried and fails on depth too.
        assert!(m.lookup("/strains/new/edit").is_none());
        assert_eq!(m.lookup("/strains/new/edit/1").unwrap().route, 2);
    }

    #[test]
    fn params_unwind_on_backtrack() {
        let m = matcher(&["/$org/settings", "/$org/$repo/settings"]);
        let found = m.lookup("/acme/tools/settings").unwrap();
        assert_eq!(found.route, 1);
        let names: Vec<_> = found.params.iter().collect();
        assert_eq!(names, [("org", "acme"), ("repo", "tools")]);
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let m = matcher(&["/", "/about"]);
        assert_eq!(m.lookup("/about/").unwrap().route, 1);
        assert_eq!(m.lookup("").unwrap().route, 0);
        assert_eq!(m.lookup("/").unwrap().route, 0);
    }

    #[test]
    fn duplicates_and_conflicts_are_rejected() {
        let mut m = matcher(&["/strains/$name"]);
        assert_eq!(
            m.insert(&RoutePattern::parse("/strains/$name/"), 5),
            Err(InsertError::Duplicate { existing: 0 })
        );
        assert_eq!(
            m.insert(&RoutePattern::parse("/strains/$id/info"), 6),
            Err(InsertError::VariableConflict {
                existing: "name".into(),
                new: "id".into()
            })
        );
    }

    #[test]
    fn literal_catch_all_and_variable_cannot_share_a_level() {
        let mut m = matcher(&["/$id"]);
        assert_eq!(
            m.insert(&RoutePattern::parse("/strains+"), 1),
            Err(InsertError::VariableConflict {
                existing: "id".into(),
                new: "strains+".into()
            })
        );

        let mut m = matcher(&["/strains+"]);
        assert!(matches!(
            m.insert(&RoutePattern::parse("/$id"), 1),
            Err(InsertError::VariableConflict { .. })
        ));
        assert!(m.insert(&RoutePattern::parse("/docs+"), 2).is_ok());
        assert_eq!(m.lookup("/strains").unwrap().route, 0);
    }
}
