//! The walk is iterative: deep chains and cyclic `ppid` links cannot exhaust
//! the stack, and every input row appears in the output exactly once.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub trait ProcessNode {
    fn pid(&self) -> i64;
    fn ppid(&self) -> Option<i64>;
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode<T> {
    pub process: T,
    pub level: usize,
    pub children: Vec<TreeNode<T>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    pub duplicate_pids: Vec<i64>,
    pub cycle_breaks: Vec<i64>,
}

impl TreeReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_pids.is_empty() && self.cycle_breaks.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Forest<T> {
    pub roots: Vec<TreeNode<T>>,
    pub report: TreeReport,
}

impl<T> Forest<T> {
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&TreeNode<T>> = self.roots.iter().collect();
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

struct Entry {
    row: usize,
    level: usize,
    parent: Option<usize>,
}

struct Frame {
    slot: usize,
    next: usize,
}

struct Index {
    pids: Vec<i64>,
    first_row: HashMap<i64, usize>,
    children_of: HashMap<i64, Vec<usize>>,
}

impl Index {
    fn build<T: ProcessNode>(rows: &[T], report: &mut TreeReport) -> Self {
        let pids: Vec<i64> = rows.iter().map(ProcessNode::pid).collect();
        let mut first_row = HashMap::with_capacity(rows.len());
        let mut dup_seen = HashSet::new();
        for (i, pid) in pids.iter().enumerate() {
            if first_row.contains_key(pid) {
                if dup_seen.insert(*pid) {
                    report.duplicate_pids.push(*pid);
                }
            } else {
                first_row.insert(*pid, i);
            }
        }

        let mut children_of: HashMap<i64, Vec<usize>> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            if let Some(parent) = row.ppid() {
                if parent != pids[i] && first_row.contains_key(&parent) {
                    children_of.entry(parent).or_default().push(i);
                }
            }
        }

        Self {
            pids,
            first_row,
            children_of,
        }
    }

    fn is_canonical(&self, row: usize) -> bool {
        self.first_row.get(&self.pids[row]) == Some(&row)
    }

    fn parent_row<T: ProcessNode>(&self, rows: &[T], row: usize) -> Option<usize> {
        let parent = rows[row].ppid()?;
        if parent == self.pids[row] {
            return None;
        }
        self.first_row.get(&parent).copied()
    }

    fn children(&self, row: usize) -> &[usize] {
        if !self.is_canonical(row) {
            return &[];
        }
        self.children_of
            .get(&self.pids[row])
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub fn build_forest<T: ProcessNode>(rows: Vec<T>) -> Forest<T> {
    let mut report = TreeReport::default();
    let index = Index::build(&rows, &mut report);
    let mut visited = vec![false; rows.len()];
    let mut order: Vec<Entry> = Vec::with_capacity(rows.len());

    for row in 0..rows.len() {
        if index.parent_row(&rows, row).is_none() {
            walk(row, &index, &mut visited, &mut order, &mut report);
        }
    }

    // Whatever is left hangs off a cycle. Climb to the first repeated
    // ancestor and root the tree there.
    for row in 0..rows.len() {
        if visited[row] {
            continue;
        }
        let start = cycle_entry(&rows, &index, &visited, row);
        walk(start, &index, &mut visited, &mut order, &mut report);
    }

    Forest {
        roots: assemble(rows, order),
        report,
    }
}

fn cycle_entry<T: ProcessNode>(rows: &[T], index: &Index, visited: &[bool], from: usize) -> usize {
    let mut climbed = HashSet::new();
    let mut current = from;
    climbed.insert(current);
    loop {
        match index.parent_row(rows, current) {
            None => return current,
            Some(parent) if visited[parent] => return current,
            Some(parent) if !climbed.insert(parent) => return parent,
            Some(parent) => current = parent,
        }
    }
}

fn walk(
    start: usize,
    index: &Index,
    visited: &mut [bool],
    order: &mut Vec<Entry>,
    report: &mut TreeReport,
) {
    let mut on_path: HashSet<i64> = HashSet::new();
    visited[start] = true;
    on_path.insert(index.pids[start]);
    order.push(Entry {
        row: start,
        level: 0,
        parent: None,
    });
    let mut stack = vec![Frame {
        slot: order.len() - 1,
        next: 0,
    }];

    while let Some(frame) = stack.last_mut() {
        let row = order[frame.slot].row;
        let Some(&child) = index.children(row).get(frame.next) else {
            on_path.remove(&index.pids[row]);
            stack.pop();
            continue;
        };
        frame.next += 1;
        let parent_slot = frame.slot;

        let child_pid = index.pids[child];
        if on_path.contains(&child_pid) {
            report.cycle_breaks.push(child_pid);
            continue;
        }
        if visited[child] {
            continue;
        }
        visited[child] = true;
        on_path.insert(child_pid);
        order.push(Entry {
            row: child,
            level: order[parent_slot].level + 1,
            parent: Some(parent_slot),
        });
        stack.push(Frame {
            slot: order.len() - 1,
            next: 0,
        });
    }
}

/// Turns the preorder listing into nested nodes. Walking it backwards
/// guarantees every node's descendants are finished before the node itself.
fn assemble<T>(rows: Vec<T>, order: Vec<Entry>) -> Vec<TreeNode<T>> {
    let mut rows: Vec<Option<T>> = rows.into_iter().map(Some).collect();
    let mut pending: Vec<Vec<TreeNode<T>>> = order.iter().map(|_| Vec::new()).collect();
    let mut roots = Vec::new();

    for (slot, entry) in order.iter().enumerate().rev() {
        let Some(process) = rows[entry.row].take() else {
            continue;
        };
        let mut children = std::mem::take(&mut pending[slot]);
        children.reverse();
        let node = TreeNode {
            process,
            level: entry.level,
            children,
        };
        match entry.parent {
            Some(parent) => pending[parent].push(node),
            None => roots.push(node),
        }
    }

    roots.reverse();
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        pid: i64,
        ppid: Option<i64>,
        name: &'static str,
    }

    impl ProcessNode for Row {
        fn pid(&self) -> i64 {
            self.pid
        }
        fn ppid(&self) -> Option<i64> {
            self.ppid
        }
    }

    fn row(pid: i64, ppid: Option<i64>, name: &'static str) -> Row {
        Row { pid, ppid, name }
    }

    fn root_names(forest: &Forest<Row>) -> Vec<&'static str> {
        forest.roots.iter().map(|n| n.process.name).collect()
    }

    #[test]
    fn empty_input_gives_empty_forest() {
        let forest = build_forest(Vec::<Row>::new());
        assert!(forest.roots.is_empty());
        assert_eq!(forest.node_count(), 0);
        assert!(forest.report.is_clean());
    }

    #[test]
    fn chain_nests_with_levels() {
        let forest = build_forest(vec![
            row(3, Some(2), "editor"),
            row(1, None, "init"),
            row(2, Some(1), "shell"),
        ]);
        assert_eq!(root_names(&forest), vec!["init"]);
        let init = &forest.roots[0];
        assert_eq!(init.level, 0);
        assert_eq!(init.children.len(), 1);
        let shell = &init.children[0];
        assert_eq!((shell.process.name, shell.level), ("shell", 1));
        assert_eq!(shell.children.len(), 1);
        let editor = &shell.children[0];
        assert_eq!((editor.process.name, editor.level), ("editor", 2));
        assert!(editor.children.is_empty());
    }

    #[test]
    fn two_node_cycle_terminates_without_duplicates() {
        let forest = build_forest(vec![row(1, Some(2), "a"), row(2, Some(1), "b")]);
        assert_eq!(forest.node_count(), 2);
        assert_eq!(root_names(&forest), vec!["a"]);
        assert_eq!(forest.roots[0].children[0].process.name, "b");
        assert_eq!(forest.report.cycle_breaks, vec![1]);
    }

    #[test]
    fn orphan_becomes_root() {
        let forest = build_forest(vec![row(1, None, "init"), row(5, Some(999), "orphan")]);
        assert_eq!(root_names(&forest), vec!["init", "orphan"]);
    }

    #[test]
    fn self_parent_is_root_not_own_child() {
        let forest = build_forest(vec![row(7, Some(7), "selfish")]);
        assert_eq!(root_names(&forest), vec!["selfish"]);
        assert!(forest.roots[0].children.is_empty());
        assert!(forest.report.is_clean());
    }

    #[test]
    fn duplicate_pid_first_row_owns_children() {
        let forest = build_forest(vec![
            row(1, None, "init"),
            row(4, Some(1), "first"),
            row(4, None, "second"),
            row(9, Some(4), "kid"),
        ]);
        assert_eq!(forest.node_count(), 4);
        assert_eq!(forest.report.duplicate_pids, vec![4]);
        assert_eq!(root_names(&forest), vec!["init", "second"]);
        let first = &forest.roots[0].children[0];
        assert_eq!(first.process.name, "first");
        assert_eq!(first.children[0].process.name, "kid");
        assert!(forest.roots[1].children.is_empty());
    }

    #[test]
    fn tail_hanging_off_cycle_is_kept() {
        // 10 <-> 11 cycle with 12 hanging off 11.
        let forest = build_forest(vec![
            row(12, Some(11), "tail"),
            row(10, Some(11), "x"),
            row(11, Some(10), "y"),
        ]);
        assert_eq!(forest.node_count(), 3);
        assert_eq!(forest.roots.len(), 1);
        assert_eq!(forest.report.cycle_breaks.len(), 1);
    }

    #[test]
    fn children_keep_input_order() {
        let forest = build_forest(vec![
            row(1, None, "init"),
            row(30, Some(1), "c"),
            row(10, Some(1), "a"),
            row(20, Some(1), "b"),
        ]);
        let names: Vec<_> = forest.roots[0]
            .children
            .iter()
            .map(|n| n.process.name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let depth = 2_000;
        let mut rows = vec![row(0, None, "root")];
        rows.extend((1..depth).map(|pid| row(pid, Some(pid - 1), "n")));
        let forest = build_forest(rows);
        assert_eq!(forest.roots.len(), 1);
        assert_eq!(forest.node_count(), depth as usize);
    }

    #[test]
    fn every_row_appears_once_in_mixed_input() {
        let rows = vec![
            row(1, None, "init"),
            row(2, Some(1), "a"),
            row(3, Some(3), "self"),
            row(4, Some(5), "c1"),
            row(5, Some(6), "c2"),
            row(6, Some(4), "c3"),
            row(7, Some(404), "orphan"),
            row(2, Some(7), "dup"),
            row(8, Some(2), "under-a"),
        ];
        let n = rows.len();
        let forest = build_forest(rows);
        assert_eq!(forest.node_count(), n);
    }
}
