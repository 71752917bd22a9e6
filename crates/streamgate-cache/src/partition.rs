//! Partition: an ordered chain of segments.
//!
//! Segments form a singly linked chain terminated by a sentinel node.
//! Cursors hold a [`Node`] and call `next()` to follow the chain; a
//! cursor parked on the last real node observes newly appended segments
//! because appending links the new node in front of the sentinel. The
//! sentinel's `next()` is itself, so walkers can never fall off the end.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::segment::Segment;

#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

struct NodeInner {
    segment: Option<Arc<Segment>>,
    next: RwLock<Option<Node>>,
}

impl Node {
    fn sentinel_node() -> Node {
        Node(Arc::new(NodeInner {
            segment: None,
            next: RwLock::new(None),
        }))
    }

    fn with_segment(segment: Arc<Segment>, sentinel: &Node) -> Node {
        Node(Arc::new(NodeInner {
            segment: Some(segment),
            next: RwLock::new(Some(sentinel.clone())),
        }))
    }

    pub fn sentinel(&self) -> bool {
        self.0.segment.is_none()
    }

    pub fn segment(&self) -> Option<&Arc<Segment>> {
        self.0.segment.as_ref()
    }

    pub fn base_offset(&self) -> Option<i64> {
        self.0.segment.as_ref().map(|s| s.base_offset())
    }

    pub fn next(&self) -> Node {
        self.0
            .next
            .read()
            .expect("node chain lock poisoned")
            .clone()
            .unwrap_or_else(|| self.clone())
    }

    fn set_next(&self, next: Node) {
        *self.0.next.write().expect("node chain lock poisoned") = Some(next);
    }

    fn same(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0.segment {
            Some(segment) => write!(f, "Node[{}]", segment.base_offset()),
            None => write!(f, "Node[sentinel]"),
        }
    }
}

pub struct Partition {
    dir: PathBuf,
    config: CacheConfig,
    sentinel: Node,
    head: RwLock<Option<Node>>,
}

impl Partition {
    pub fn new(dir: impl AsRef<Path>, config: CacheConfig) -> Result<Arc<Partition>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Directory(format!("{}: {e}", dir.display())))?;
        Ok(Arc::new(Partition {
            dir,
            config,
            sentinel: Node::sentinel_node(),
            head: RwLock::new(None),
        }))
    }

    /// First retained offset, or 0 when the partition is empty.
    pub fn base_offset(&self) -> i64 {
        self.head()
            .base_offset()
            .unwrap_or(0)
    }

    /// First real node, or the sentinel when the partition is empty.
    pub fn head(&self) -> Node {
        self.head
            .read()
            .expect("partition lock poisoned")
            .clone()
            .unwrap_or_else(|| self.sentinel.clone())
    }

    /// The node covering `offset`, the nearest forward node when
    /// `offset` precedes retained data, or the sentinel when empty.
    pub fn node_at(&self, offset: i64) -> Node {
        let mut node = self.head();
        loop {
            if node.sentinel() {
                return node;
            }
            let next = node.next();
            match next.base_offset() {
                Some(next_base) if next_base <= offset => node = next,
                _ => return node,
            }
        }
    }

    /// Last appended segment, if any.
    pub fn tail_segment(&self) -> Option<Arc<Segment>> {
        let mut node = self.head();
        if node.sentinel() {
            return None;
        }
        loop {
            let next = node.next();
            if next.sentinel() || next.same(&node) {
                return node.segment().cloned();
            }
            node = next;
        }
    }

    /// Appends a fresh segment rooted at `base_offset` and links it at
    /// the tail.
    pub fn append_segment(&self, base_offset: i64) -> Result<Arc<Segment>> {
        let segment = Segment::create(&self.dir, base_offset, &self.config)?;
        let node = Node::with_segment(Arc::clone(&segment), &self.sentinel);

        let mut head = self.head.write().expect("partition lock poisoned");
        match head.as_ref() {
            None => *head = Some(node),
            Some(first) => {
                let mut tail = first.clone();
                loop {
                    let next = tail.next();
                    if next.sentinel() {
                        break;
                    }
                    tail = next;
                }
                tail.set_next(node);
            }
        }
        Ok(segment)
    }

    /// Retires every segment wholly below `offset`; their files are
    /// reclaimed once the last cursor releases them.
    pub fn retain_from(&self, offset: i64) {
        let mut head = self.head.write().expect("partition lock poisoned");
        while let Some(first) = head.clone() {
            let next = first.next();
            match next.base_offset() {
                Some(next_base) if next_base <= offset => {
                    if let Some(segment) = first.segment() {
                        segment.retire();
                    }
                    *head = Some(next);
                }
                _ => break,
            }
        }
    }
}
