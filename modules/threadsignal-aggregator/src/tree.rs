// Platform-agnostic tree reconstruction.
//
// Input is the root plus a flat list of nodes in arrival order. Output is a
// tree whose shape depends only on the node set: unknown parents attach to
// the root, every member of a cyclic parent chain is reparented to the root,
// and siblings are ordered by (published_at, id).

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::{debug, info, warn};

use threadsignal_common::{CommentNode, RawNode, SkipReason};

/// A built tree plus what the builder had to skip or repair.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltTree {
    pub root: CommentNode,
    /// Reply nodes placed in the tree.
    pub processed: usize,
    pub orphans_adopted: usize,
    pub skipped: Vec<SkipReason>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    InProgress,
    Done,
}

pub struct TreeBuilder;

impl TreeBuilder {
    /// Build the canonical tree. Never fails: malformed nodes are skipped and
    /// reported, duplicates keep their first occurrence.
    pub fn build(root: RawNode, nodes: Vec<RawNode>) -> BuiltTree {
        let root_id = root.id.clone();
        let mut skipped = Vec::new();

        // Index nodes by id, first occurrence wins.
        let mut kept: Vec<RawNode> = Vec::with_capacity(nodes.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(nodes.len());
        for raw in nodes {
            if raw.id.trim().is_empty() {
                warn!(parent_id = ?raw.parent_id, "Skipping node without id");
                skipped.push(SkipReason::MalformedNode {
                    id: None,
                    error: "node has no id".to_string(),
                });
                continue;
            }
            if raw.id == root_id || index.contains_key(&raw.id) {
                debug!(id = %raw.id, "Ignoring duplicate node");
                continue;
            }
            index.insert(raw.id.clone(), kept.len());
            kept.push(raw);
        }

        // Resolve parents. None means "attached to root".
        let mut orphans_adopted = 0;
        let mut parent: Vec<Option<usize>> = Vec::with_capacity(kept.len());
        for (i, raw) in kept.iter().enumerate() {
            let declared = raw
                .parent_id
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty());
            let resolved = match declared {
                None => None,
                Some(p) if p == root_id => None,
                Some(p) => match index.get(p) {
                    Some(&j) => Some(j),
                    None => {
                        debug!(id = %raw.id, missing_parent = p, "Adopting orphan under root");
                        orphans_adopted += 1;
                        None
                    }
                },
            };
            if resolved == Some(i) {
                warn!(id = %raw.id, "Node declares itself as parent, reparenting to root");
                skipped.push(SkipReason::CycleBroken { id: raw.id.clone() });
                parent.push(None);
            } else {
                parent.push(resolved);
            }
        }

        Self::break_cycles(&kept, &mut parent, &mut skipped);

        // Child lists, sorted by (published_at, id).
        let mut root_children: Vec<usize> = Vec::new();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); kept.len()];
        for (i, p) in parent.iter().enumerate() {
            match p {
                Some(j) => children[*j].push(i),
                None => root_children.push(i),
            }
        }
        let order = |a: &usize, b: &usize| -> Ordering {
            let (na, nb) = (&kept[*a], &kept[*b]);
            na.published_at
                .cmp(&nb.published_at)
                .then_with(|| na.id.cmp(&nb.id))
        };
        root_children.sort_by(order);
        for list in children.iter_mut() {
            list.sort_by(order);
        }

        // Pre-order walk, then assemble bottom-up so deep threads never recurse.
        let mut preorder = Vec::with_capacity(kept.len());
        let mut stack: Vec<usize> = root_children.iter().rev().copied().collect();
        while let Some(i) = stack.pop() {
            preorder.push(i);
            stack.extend(children[i].iter().rev().copied());
        }

        let parent_ids: Vec<String> = parent
            .iter()
            .map(|p| match p {
                Some(j) => kept[*j].id.clone(),
                None => root_id.clone(),
            })
            .collect();
        let mut built: Vec<Option<CommentNode>> = kept
            .into_iter()
            .zip(parent_ids)
            .map(|(raw, parent_id)| Some(CommentNode::from_raw(raw, Some(parent_id))))
            .collect();

        for &i in preorder.iter().rev() {
            let attached: Vec<CommentNode> = children[i]
                .iter()
                .filter_map(|&c| built[c].take())
                .collect();
            if let Some(node) = built[i].as_mut() {
                node.children = attached;
            }
        }

        let mut root_node = CommentNode::from_raw(root, None);
        root_node.children = root_children
            .iter()
            .filter_map(|&c| built[c].take())
            .collect();

        let processed = preorder.len();
        if orphans_adopted > 0 {
            info!(root = %root_id, orphans_adopted, "Orphaned nodes attached to root");
        }

        BuiltTree {
            root: root_node,
            processed,
            orphans_adopted,
            skipped,
        }
    }

    /// Walk every ancestor chain; each member of a cycle is reparented to root.
    fn break_cycles(kept: &[RawNode], parent: &mut [Option<usize>], skipped: &mut Vec<SkipReason>) {
        let mut state = vec![Visit::Pending; kept.len()];
        for start in 0..kept.len() {
            if state[start] != Visit::Pending {
                continue;
            }
            let mut path = Vec::new();
            let mut cursor = Some(start);
            while let Some(i) = cursor {
                match state[i] {
                    Visit::Done => break,
                    Visit::InProgress => {
                        let begin = path.iter().position(|&p| p == i).unwrap_or(0);
                        let mut members: Vec<usize> = path[begin..].to_vec();
                        members.sort_by(|a, b| kept[*a].id.cmp(&kept[*b].id));
                        for m in members {
                            warn!(id = %kept[m].id, "Cyclic parent chain, reparenting to root");
                            parent[m] = None;
                            skipped.push(SkipReason::CycleBroken {
                                id: kept[m].id.clone(),
                            });
                        }
                        break;
                    }
                    Visit::Pending => {
                        state[i] = Visit::InProgress;
                        path.push(i);
                        cursor = parent[i];
                    }
                }
            }
            for i in path {
                state[i] = Visit::Done;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::node;

    fn ids(node: &CommentNode) -> Vec<&str> {
        node.child_ids()
    }

    #[test]
    fn reconstructs_nested_replies_and_adopts_orphans() {
        let built = TreeBuilder::build(
            node("p1", None, 0),
            vec![
                node("c1", Some("p1"), 1),
                node("c2", Some("c1"), 2),
                node("c3", Some("zzz"), 3),
            ],
        );

        assert_eq!(ids(&built.root), vec!["c1", "c3"]);
        let c1 = built.root.find("c1").unwrap();
        assert_eq!(ids(c1), vec!["c2"]);
        assert_eq!(built.root.find("c3").unwrap().parent_id.as_deref(), Some("p1"));
        assert_eq!(built.processed, 3);
        assert_eq!(built.orphans_adopted, 1);
        assert!(built.skipped.is_empty());
        assert!(built.root.parent_id.is_none());
    }

    #[test]
    fn parents_may_arrive_after_children() {
        let built = TreeBuilder::build(
            node("p1", None, 0),
            vec![node("c2", Some("c1"), 2), node("c1", Some("p1"), 1)],
        );
        assert_eq!(ids(&built.root), vec!["c1"]);
        assert_eq!(ids(built.root.find("c1").unwrap()), vec!["c2"]);
    }

    #[test]
    fn two_node_cycle_attaches_both_to_root() {
        let built = TreeBuilder::build(
            node("p1", None, 0),
            vec![node("x", Some("y"), 1), node("y", Some("x"), 2)],
        );

        assert_eq!(ids(&built.root), vec!["x", "y"]);
        assert!(built.root.find("x").unwrap().children.is_empty());
        assert!(built.root.find("y").unwrap().children.is_empty());
        assert_eq!(
            built.skipped,
            vec![
                SkipReason::CycleBroken { id: "x".into() },
                SkipReason::CycleBroken { id: "y".into() },
            ]
        );
        assert_eq!(built.processed, 2);
    }

    #[test]
    fn cycle_tail_stays_under_its_parent() {
        // a -> b -> c -> a, with d hanging off b
        let built = TreeBuilder::build(
            node("p1", None, 0),
            vec![
                node("a", Some("c"), 1),
                node("b", Some("a"), 2),
                node("c", Some("b"), 3),
                node("d", Some("b"), 4),
            ],
        );
        assert_eq!(ids(&built.root), vec!["a", "b", "c"]);
        assert_eq!(ids(built.root.find("b").unwrap()), vec!["d"]);
        assert_eq!(built.root.node_count(), 5);
    }

    #[test]
    fn self_parent_is_reparented() {
        let built = TreeBuilder::build(node("p1", None, 0), vec![node("s", Some("s"), 1)]);
        assert_eq!(ids(&built.root), vec!["s"]);
        assert_eq!(built.skipped, vec![SkipReason::CycleBroken { id: "s".into() }]);
    }

    #[test]
    fn siblings_sort_by_time_then_id_regardless_of_arrival() {
        let arrivals = vec![
            node("b", Some("p1"), 5),
            node("c", Some("p1"), 1),
            node("a", Some("p1"), 5),
        ];
        let mut reversed = arrivals.clone();
        reversed.reverse();

        let first = TreeBuilder::build(node("p1", None, 0), arrivals);
        let second = TreeBuilder::build(node("p1", None, 0), reversed);

        assert_eq!(ids(&first.root), vec!["c", "a", "b"]);
        assert_eq!(first.root, second.root);
    }

    #[test]
    fn rebuilding_the_same_input_is_identical() {
        let input = vec![
            node("c1", Some("p1"), 1),
            node("c2", Some("c1"), 2),
            node("x", Some("y"), 3),
            node("y", Some("x"), 4),
            node("c3", Some("gone"), 5),
        ];
        let first = TreeBuilder::build(node("p1", None, 0), input.clone());
        let second = TreeBuilder::build(node("p1", None, 0), input);
        assert_eq!(first, second);
    }

    #[test]
    fn missing_timestamps_sort_first() {
        let mut undated = node("z", Some("p1"), 0);
        undated.published_at = None;
        let built = TreeBuilder::build(
            node("p1", None, 0),
            vec![node("a", Some("p1"), 1), undated],
        );
        assert_eq!(ids(&built.root), vec!["z", "a"]);
    }

    #[test]
    fn malformed_and_duplicate_nodes_are_skipped() {
        let built = TreeBuilder::build(
            node("p1", None, 0),
            vec![
                node("c1", Some("p1"), 1),
                node("", Some("p1"), 2),
                node("c1", Some("p1"), 3),
                node("p1", None, 4),
                node("c2", Some(""), 5),
            ],
        );
        assert_eq!(ids(&built.root), vec!["c1", "c2"]);
        assert_eq!(built.processed, 2);
        assert_eq!(built.skipped.len(), 1);
        assert!(matches!(built.skipped[0], SkipReason::MalformedNode { id: None, .. }));
        // first occurrence kept
        assert_eq!(
            built.root.find("c1").unwrap().published_at,
            node("c1", None, 1).published_at
        );
    }

    #[test]
    fn every_distinct_id_appears_exactly_once() {
        let mut nodes = Vec::new();
        for i in 0..200 {
            let parent = match i % 4 {
                0 => "root".to_string(),
                1 => format!("n{}", i / 2),
                2 => format!("missing{i}"),
                _ => format!("n{}", (i * 7) % 200),
            };
            nodes.push(node(&format!("n{i}"), Some(&parent), (i % 13) as i64));
        }

        let built = TreeBuilder::build(node("root", None, 0), nodes.clone());
        assert_eq!(built.root.node_count(), 201);
        for i in 0..200 {
            assert!(built.root.find(&format!("n{i}")).is_some());
        }

        let again = TreeBuilder::build(node("root", None, 0), nodes);
        assert_eq!(built, again);
    }

    #[test]
    fn deep_chains_do_not_overflow() {
        let nodes: Vec<RawNode> = (0..5_000)
            .map(|i| {
                let parent = if i == 0 {
                    "root".to_string()
                } else {
                    format!("n{}", i - 1)
                };
                node(&format!("n{i}"), Some(&parent), i as i64)
            })
            .collect();
        let built = TreeBuilder::build(node("root", None, 0), nodes);
        assert_eq!(built.processed, 5_000);
        assert_eq!(built.root.depth(), 5_000);
    }
}
