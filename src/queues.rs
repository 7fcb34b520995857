use std::fmt;

use anyhow::Result;
use tracing::warn;

use crate::catalog::QueueCatalog;
use crate::errors::CommandError;
use crate::selector::{Selector, WILDCARD_MATCH};

/// The queues one worker process consumes. Never empty and free of
/// duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueGroup(Vec<String>);

impl QueueGroup {
    fn from_queues(queues: Vec<String>) -> Option<Self> {
        let mut unique: Vec<String> = Vec::with_capacity(queues.len());
        for queue in queues {
            if !unique.contains(&queue) {
                unique.push(queue);
            }
        }

        if unique.is_empty() {
            None
        } else {
            Some(Self(unique))
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sorted(&self) -> Vec<String> {
        let mut queues = self.0.clone();
        queues.sort();
        queues
    }
}

impl fmt::Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    pub queue_selector: bool,
    pub negate: bool,
}

pub fn resolve_queue_groups(
    arguments: &[String],
    catalog: &QueueCatalog,
    options: ResolveOptions,
) -> Result<Vec<QueueGroup>> {
    let all_queues = catalog.queue_names();

    let mut resolved = Vec::with_capacity(arguments.len());
    for argument in arguments {
        if argument.contains(['\r', '\n']) {
            return Err(CommandError::new("The queue arguments cannot contain newlines").into());
        }

        let queues = if argument == WILDCARD_MATCH {
            all_queues.clone()
        } else if options.queue_selector {
            Selector::parse(argument)?.select(catalog.workers())
        } else {
            let requested: Vec<&str> = argument.split(',').filter(|q| !q.is_empty()).collect();
            expand_queues(&requested, &all_queues)
        };
        resolved.push(queues);
    }

    if options.negate {
        resolved = resolved
            .into_iter()
            .map(|selected| {
                all_queues
                    .iter()
                    .filter(|queue| !selected.contains(queue))
                    .cloned()
                    .collect::<Vec<String>>()
            })
            .collect();
    }

    let total = resolved.len();
    let groups: Vec<QueueGroup> = resolved
        .into_iter()
        .filter_map(QueueGroup::from_queues)
        .collect();

    if groups.is_empty() {
        return Err(
            CommandError::new("No queues found, you must select at least one queue").into(),
        );
    }
    if groups.len() < total {
        warn!(
            "{} queue group(s) resolved to no queues and will not get a worker",
            total - groups.len()
        );
    }

    Ok(groups)
}

pub fn expand_queues(requested: &[&str], all_queues: &[String]) -> Vec<String> {
    requested
        .iter()
        .flat_map(|queue| {
            let prefix = format!("{queue}:");
            std::iter::once(queue.to_string()).chain(
                all_queues
                    .iter()
                    .filter(move |known| known.starts_with(&prefix))
                    .cloned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{expand_queues, resolve_queue_groups, QueueGroup, ResolveOptions};
    use crate::catalog::{QueueCatalog, WorkerMetadata};
    use crate::errors::{CommandError, QueryError};

    fn catalog(names: &[&str]) -> QueueCatalog {
        QueueCatalog::new(names.iter().map(|name| WorkerMetadata::named(*name)).collect())
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn names(groups: &[QueueGroup]) -> Vec<Vec<&str>> {
        groups
            .iter()
            .map(|group| group.queues().iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn literal_lists_become_one_group_each() {
        let groups = resolve_queue_groups(
            &args(&["foo,bar,baz", "solo"]),
            &catalog(&["foo", "bar", "baz"]),
            ResolveOptions::default(),
        )
        .expect("expected groups");
        assert_eq!(names(&groups), vec![vec!["foo", "bar", "baz"], vec!["solo"]]);
    }

    #[test]
    fn wildcard_is_the_whole_catalog() {
        let known = catalog(&["foo", "bar", "baz"]);
        for options in [
            ResolveOptions::default(),
            ResolveOptions {
                queue_selector: true,
                negate: false,
            },
        ] {
            let groups =
                resolve_queue_groups(&args(&["*"]), &known, options).expect("expected groups");
            assert_eq!(names(&groups), vec![vec!["foo", "bar", "baz"]]);
        }
    }

    #[test]
    fn namespaces_expand_to_their_members() {
        let groups = resolve_queue_groups(
            &args(&["cronjob"]),
            &catalog(&["cronjob:foo", "cronjob:bar", "cronjobs"]),
            ResolveOptions::default(),
        )
        .expect("expected groups");
        assert_eq!(
            names(&groups),
            vec![vec!["cronjob", "cronjob:foo", "cronjob:bar"]]
        );
    }

    #[test]
    fn duplicates_within_a_group_are_dropped() {
        let groups = resolve_queue_groups(
            &args(&["cronjob,cronjob:foo,foo,foo"]),
            &catalog(&["cronjob:foo"]),
            ResolveOptions::default(),
        )
        .expect("expected groups");
        assert_eq!(names(&groups), vec![vec!["cronjob", "cronjob:foo", "foo"]]);
    }

    #[test]
    fn negate_takes_the_complement_per_group() {
        let groups = resolve_queue_groups(
            &args(&["foo", "bar"]),
            &catalog(&["foo", "bar", "baz"]),
            ResolveOptions {
                queue_selector: false,
                negate: true,
            },
        )
        .expect("expected groups");
        assert_eq!(names(&groups), vec![vec!["bar", "baz"], vec!["foo", "baz"]]);
    }

    #[test]
    fn negate_drops_groups_left_empty() {
        let groups = resolve_queue_groups(
            &args(&["*", "foo"]),
            &catalog(&["foo", "bar"]),
            ResolveOptions {
                queue_selector: false,
                negate: true,
            },
        )
        .expect("expected groups");
        assert_eq!(names(&groups), vec![vec!["bar"]]);
    }

    #[test]
    fn newlines_are_rejected() {
        let known = catalog(&["foo"]);
        for invalid in [args(&["foo\n"]), args(&["foo\r"]), args(&["foo", "b\nar"])] {
            let err = resolve_queue_groups(&invalid, &known, ResolveOptions::default())
                .expect_err("expected newline rejection");
            assert!(err.downcast_ref::<CommandError>().is_some(), "unexpected error: {err}");
        }
    }

    #[test]
    fn empty_selection_is_a_command_error() {
        let err = resolve_queue_groups(
            &args(&["urgency=high"]),
            &catalog(&["foo"]),
            ResolveOptions {
                queue_selector: true,
                negate: false,
            },
        )
        .expect_err("expected empty selection to fail");
        assert_eq!(
            err.downcast_ref::<CommandError>(),
            Some(&CommandError::new(
                "No queues found, you must select at least one queue"
            ))
        );
    }

    #[test]
    fn no_arguments_is_a_command_error() {
        let err = resolve_queue_groups(&[], &catalog(&["foo"]), ResolveOptions::default())
            .expect_err("expected missing arguments to fail");
        assert!(err.downcast_ref::<CommandError>().is_some());
    }

    #[test]
    fn selector_errors_stay_query_errors() {
        let err = resolve_queue_groups(
            &args(&["unknown_field=chatops"]),
            &catalog(&["foo"]),
            ResolveOptions {
                queue_selector: true,
                negate: false,
            },
        )
        .expect_err("expected query error");
        assert!(err.downcast_ref::<QueryError>().is_some(), "unexpected error: {err}");
        assert!(err.downcast_ref::<CommandError>().is_none());
    }

    #[test]
    fn resolution_is_deterministic() {
        let known = catalog(&["a:1", "a:2", "b", "c"]);
        let arguments = args(&["a", "b,c"]);
        let first = resolve_queue_groups(&arguments, &known, ResolveOptions::default())
            .expect("first resolution");
        let second = resolve_queue_groups(&arguments, &known, ResolveOptions::default())
            .expect("second resolution");
        assert_eq!(first, second);
    }

    #[test]
    fn expand_queues_keeps_unknown_literals() {
        assert_eq!(expand_queues(&["foo"], &[]), vec!["foo".to_string()]);
    }

    #[test]
    fn sorted_and_display_render_the_group() {
        let group = QueueGroup::from_queues(vec!["b".to_string(), "a".to_string()])
            .expect("non-empty group");
        assert_eq!(group.sorted(), vec!["a", "b"]);
        assert_eq!(group.to_string(), "b,a");
        assert_eq!(group.len(), 2);
    }
}
