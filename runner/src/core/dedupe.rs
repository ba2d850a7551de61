//! Dedupe pre-pass: test each nested composite type once.
//!
//! Walking the catalog in order, the first occurrence of a nested type (a
//! non-root path with a known `type_name` and at least one descendant path)
//! becomes its representative. Later occurrences point at it and their
//! descendants are marked `child_of_duplicate`; the sequencer skips both.
//!
//! Paths are assumed to be declared parents-first, which is how catalog
//! discovery walks a type.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::core::types::{DuplicateRef, PathSpec, ROOT_PATH, TypeRecord};

/// Counts produced by [`dedupe_catalog`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupeReport {
    pub representatives: usize,
    pub duplicates: usize,
    pub children_of_duplicates: usize,
}

/// True when `path` lies strictly below `ancestor` (`.a` -> `.a.b`, `.a[0]`).
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT_PATH {
        return path != ROOT_PATH;
    }
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.starts_with('.') || rest.starts_with('['),
        None => false,
    }
}

fn has_descendants(paths: &IndexMap<String, PathSpec>, path: &str) -> bool {
    paths.keys().any(|other| is_descendant(other, path))
}

fn nested_type<'a>(paths: &IndexMap<String, PathSpec>, path: &str, spec: &'a PathSpec) -> Option<&'a str> {
    if path == ROOT_PATH {
        return None;
    }
    let type_name = spec.type_name.as_deref()?;
    has_descendants(paths, path).then_some(type_name)
}

/// Recompute every dedupe marker in `type_guide`. Idempotent.
pub fn dedupe_catalog(type_guide: &mut IndexMap<String, TypeRecord>) -> DedupeReport {
    let mut report = DedupeReport::default();
    let mut representatives: HashMap<String, (String, String)> = HashMap::new();

    for record in type_guide.values_mut() {
        for spec in record.mutation_paths.values_mut() {
            spec.duplicate_of = None;
        }
    }

    for (parent, record) in type_guide.iter_mut() {
        let mut duplicate_roots: Vec<String> = Vec::new();
        let mut marks: Vec<(String, DuplicateRef)> = Vec::new();

        for (path, spec) in &record.mutation_paths {
            if duplicate_roots.iter().any(|root| is_descendant(path, root)) {
                continue;
            }
            let Some(type_name) = nested_type(&record.mutation_paths, path, spec) else {
                continue;
            };
            match representatives.get(type_name) {
                Some((rep_parent, rep_path)) => {
                    marks.push((
                        path.clone(),
                        DuplicateRef::Representative {
                            parent: rep_parent.clone(),
                            path: rep_path.clone(),
                        },
                    ));
                    duplicate_roots.push(path.clone());
                }
                None => {
                    representatives.insert(type_name.to_string(), (parent.clone(), path.clone()));
                    report.representatives += 1;
                }
            }
        }

        for (path, spec) in &mut record.mutation_paths {
            if duplicate_roots.iter().any(|root| is_descendant(path, root)) {
                spec.duplicate_of = Some(DuplicateRef::ChildOfDuplicate);
                report.children_of_duplicates += 1;
            }
        }
        for (path, mark) in marks {
            if let Some(spec) = record.mutation_paths.get_mut(&path) {
                spec.duplicate_of = Some(mark);
                report.duplicates += 1;
            }
        }
    }

    report
}

/// Check dedupe markers for consistency; returns one message per violation.
///
/// - every representative reference resolves to an unmarked path of the same type
/// - every deduplicated type has exactly one unmarked occurrence
/// - every `child_of_duplicate` sits below a marked duplicate
pub fn validate_dedupe(type_guide: &IndexMap<String, TypeRecord>) -> Vec<String> {
    let mut errors = Vec::new();
    let mut deduplicated: HashSet<String> = HashSet::new();

    for (parent, record) in type_guide {
        for (path, spec) in &record.mutation_paths {
            match &spec.duplicate_of {
                None => {}
                Some(DuplicateRef::Representative {
                    parent: rep_parent,
                    path: rep_path,
                }) => {
                    let location = format!("{parent} '{path}'");
                    let Some(type_name) = spec.type_name.as_deref() else {
                        errors.push(format!("{location}: duplicate without type_name"));
                        continue;
                    };
                    deduplicated.insert(type_name.to_string());
                    let target = type_guide
                        .get(rep_parent)
                        .and_then(|rep| rep.mutation_paths.get(rep_path));
                    match target {
                        None => errors.push(format!(
                            "{location}: representative {rep_parent} '{rep_path}' not found"
                        )),
                        Some(rep) if rep.duplicate_of.is_some() => errors.push(format!(
                            "{location}: representative {rep_parent} '{rep_path}' is itself a duplicate"
                        )),
                        Some(rep) if rep.type_name.as_deref() != Some(type_name) => {
                            errors.push(format!(
                                "{location}: representative {rep_parent} '{rep_path}' has a different type"
                            ));
                        }
                        Some(_) => {}
                    }
                }
                Some(DuplicateRef::ChildOfDuplicate) => {
                    let anchored = record.mutation_paths.iter().any(|(other, other_spec)| {
                        is_descendant(path, other)
                            && matches!(
                                other_spec.duplicate_of,
                                Some(DuplicateRef::Representative { .. })
                            )
                    });
                    if !anchored {
                        errors.push(format!(
                            "{parent} '{path}': child_of_duplicate without a duplicate ancestor"
                        ));
                    }
                }
            }
        }
    }

    let mut deduplicated: Vec<String> = deduplicated.into_iter().collect();
    deduplicated.sort();
    for type_name in deduplicated {
        let mut count = 0;
        for record in type_guide.values() {
            for (path, spec) in &record.mutation_paths {
                if spec.duplicate_of.is_none()
                    && nested_type(&record.mutation_paths, path, spec) == Some(type_name.as_str())
                {
                    count += 1;
                }
            }
        }
        if count != 1 {
            errors.push(format!(
                "{type_name}: expected exactly one representative, found {count}"
            ));
        }
    }

    errors
}
