//! Dependency graph between the fields of one pipeline.
//!
//! An edge `a -> b` means field `a` reads field `b`: one of `a`'s rules has a
//! condition on `b`, `a` is stage-required and `b` is the stage field, or
//! `a`'s templates mention `{b}`. Cycles are allowed and reported.

use crate::catalog::{slugify, FieldDefinition, PipelineSchema};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

type SlugMap = BTreeMap<String, BTreeSet<String>>;

/// One discovery step of a cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeStep {
    /// Field whose change propagates.
    pub from: String,
    /// Field reached.
    pub to: String,
    /// Depth of `to`.
    pub depth: usize,
}

/// Fields affected by a change to one field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cascade {
    /// Affected slugs, the changed slug included.
    pub affected: BTreeSet<String>,
    /// Shortest distance from the changed slug.
    pub level_of: BTreeMap<String, usize>,
    /// Discovery edges in BFS order.
    pub chain: Vec<CascadeStep>,
}

impl Cascade {
    /// Deepest level reached.
    pub fn max_depth(&self) -> usize {
        self.level_of.values().copied().max().unwrap_or(0)
    }
}

/// Forward and reverse dependency maps of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    forward: SlugMap,
    reverse: SlugMap,
    cycles: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph for a pipeline's active fields.
    pub fn build(schema: &PipelineSchema) -> Self {
        Self::from_fields(&schema.fields, schema.stage_field())
    }

    /// Build the graph for a set of fields.
    pub fn from_fields(fields: &[FieldDefinition], stage_field: Option<&str>) -> Self {
        let forward = Self::build_forward(fields, stage_field);
        let reverse = Self::build_reverse(&forward);
        let mut graph = Self {
            forward,
            reverse,
            cycles: Vec::new(),
        };
        graph.cycles = graph.detect_cycles();
        if !graph.cycles.is_empty() {
            tracing::warn!(
                cycles = graph.cycles.len(),
                first = %graph.cycles[0].join(" -> "),
                "business rules contain dependency cycles"
            );
        }
        graph
    }

    /// Map each active field to the slugs it reads.
    ///
    /// References to unknown slugs and to the field itself are ignored.
    pub fn build_forward(fields: &[FieldDefinition], stage_field: Option<&str>) -> SlugMap {
        let known: BTreeSet<&str> = fields
            .iter()
            .filter(|f| f.is_active())
            .map(|f| f.slug.as_str())
            .collect();

        let mut forward = SlugMap::new();
        for field in fields.iter().filter(|f| f.is_active()) {
            let mut refs = field.business_rules.referenced_slugs();
            if field.business_rules.stage_requirement.is_some() {
                if let Some(stage) = stage_field {
                    refs.insert(stage.to_string());
                }
            }
            for text in field.config.template_texts() {
                refs.extend(extract_tokens(text));
            }
            refs.extend(field.config.trigger_fields().iter().cloned());
            refs.retain(|slug| slug != &field.slug && known.contains(slug.as_str()));
            forward.insert(field.slug.clone(), refs);
        }
        forward
    }

    /// Invert a forward map: each slug maps to the slugs that read it.
    pub fn build_reverse(forward: &SlugMap) -> SlugMap {
        let mut reverse = SlugMap::new();
        for (slug, refs) in forward {
            reverse.entry(slug.clone()).or_default();
            for target in refs {
                reverse
                    .entry(target.clone())
                    .or_default()
                    .insert(slug.clone());
            }
        }
        reverse
    }

    /// Find cycles with a depth-first search over the forward map.
    ///
    /// Each cycle is rotated to start at its smallest slug and reported once.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut found: BTreeSet<Vec<String>> = BTreeSet::new();

        for start in self.forward.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            // Explicit recursion stack of (node, remaining neighbours).
            let mut stack: Vec<(&str, Vec<&str>)> = vec![(start.as_str(), self.neighbours(start))];
            marks.insert(start.as_str(), Mark::Visiting);

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                match top.1.pop() {
                    Some(next) => match marks.get(next) {
                        Some(Mark::Visiting) => {
                            if let Some(pos) = stack.iter().position(|(n, _)| *n == next) {
                                let cycle: Vec<String> =
                                    stack[pos..].iter().map(|(n, _)| n.to_string()).collect();
                                found.insert(normalize_cycle(cycle));
                            }
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next, Mark::Visiting);
                            stack.push((next, self.neighbours(next)));
                        }
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }

        found.into_iter().collect()
    }

    fn neighbours(&self, slug: &str) -> Vec<&str> {
        // Reversed so popping visits neighbours in ascending order.
        self.forward
            .get(slug)
            .map(|refs| refs.iter().rev().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Breadth-first walk over the reverse map from `changed`.
    ///
    /// Each slug is recorded at the depth it is first reached, which is its
    /// shortest distance. Cycles terminate because visited slugs are skipped.
    pub fn cascade(&self, changed: &str) -> Cascade {
        let mut cascade = Cascade::default();
        cascade.affected.insert(changed.to_string());
        cascade.level_of.insert(changed.to_string(), 0);

        let mut queue = VecDeque::from([(changed.to_string(), 0usize)]);
        while let Some((slug, depth)) = queue.pop_front() {
            let Some(dependents) = self.reverse.get(&slug) else {
                continue;
            };
            for dependent in dependents {
                if cascade.affected.insert(dependent.clone()) {
                    cascade.level_of.insert(dependent.clone(), depth + 1);
                    cascade.chain.push(CascadeStep {
                        from: slug.clone(),
                        to: dependent.clone(),
                        depth: depth + 1,
                    });
                    queue.push_back((dependent.clone(), depth + 1));
                }
            }
        }
        cascade
    }

    /// Slugs `slug` reads.
    pub fn dependencies_of(&self, slug: &str) -> Option<&BTreeSet<String>> {
        self.forward.get(slug)
    }

    /// Slugs that read `slug`.
    pub fn dependents_of(&self, slug: &str) -> Vec<String> {
        self.reverse
            .get(slug)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forward map.
    pub fn forward(&self) -> &SlugMap {
        &self.forward
    }

    /// Reverse map.
    pub fn reverse(&self) -> &SlugMap {
        &self.reverse
    }

    /// Cycles found when the graph was built.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }
}

fn normalize_cycle(mut cycle: Vec<String>) -> Vec<String> {
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}

/// Slug tokens written as `{slug}` or `{{slug}}` in template text.
pub fn extract_tokens(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let token = after[..close].trim_matches(|c: char| c == '{' || c.is_whitespace());
        if !token.is_empty() && slugify(token) == token {
            tokens.insert(token.to_string());
        }
        rest = &after[close + 1..];
    }
    tokens
}
