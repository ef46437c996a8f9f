//! Reference frame tree.
//!
//! Goal: a single arena of named coordinate frames, each storing a rigid
//! transform to its parent. World transforms are composed on read and
//! memoized; writing a frame's transform dirties its whole subtree so the
//! next read recomputes. The tree is rooted at one world frame and stays
//! acyclic (parents are arena keys, never owning pointers).

use nalgebra::Isometry3;
use slotmap::{SlotMap, new_key_type};
use thiserror::Error;

new_key_type! {
    /// Stable key for a frame in a [`FrameTree`].
    pub struct FrameId;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame id is not in the tree")]
    UnknownFrame,
    #[error("reparenting a frame under its own descendant would create a cycle")]
    Cycle,
    #[error("the world frame has no parent transform")]
    WorldFrame,
}

#[derive(Debug)]
struct FrameNode {
    name: String,
    parent: Option<FrameId>,
    children: Vec<FrameId>,
    to_parent: Isometry3<f64>,
    cached_to_world: Option<Isometry3<f64>>,
    dirty: bool,
}

#[derive(Debug)]
pub struct FrameTree {
    frames: SlotMap<FrameId, FrameNode>,
    world: FrameId,
}

impl Default for FrameTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTree {
    pub fn new() -> Self {
        let mut frames = SlotMap::with_key();
        let world = frames.insert(FrameNode {
            name: "world".to_string(),
            parent: None,
            children: Vec::new(),
            to_parent: Isometry3::identity(),
            cached_to_world: Some(Isometry3::identity()),
            dirty: false,
        });
        Self { frames, world }
    }

    /// The root frame every other frame descends from.
    #[inline]
    pub fn world(&self) -> FrameId {
        self.world
    }

    /// Number of frames, world included.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.frames.contains_key(id)
    }

    /// Insert a new frame under `parent`. The new frame starts dirty so its
    /// first world-transform read composes the ancestor chain.
    pub fn add_frame(
        &mut self,
        name: impl Into<String>,
        parent: FrameId,
        to_parent: Isometry3<f64>,
    ) -> Result<FrameId, FrameError> {
        if !self.frames.contains_key(parent) {
            return Err(FrameError::UnknownFrame);
        }
        let id = self.frames.insert(FrameNode {
            name: name.into(),
            parent: Some(parent),
            children: Vec::new(),
            to_parent,
            cached_to_world: None,
            dirty: true,
        });
        if let Some(p) = self.frames.get_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    pub fn name(&self, id: FrameId) -> Option<&str> {
        self.frames.get(id).map(|n| n.name.as_str())
    }

    pub fn parent_of(&self, id: FrameId) -> Option<FrameId> {
        self.frames.get(id).and_then(|n| n.parent)
    }

    pub fn children_of(&self, id: FrameId) -> &[FrameId] {
        static EMPTY: [FrameId; 0] = [];
        self.frames.get(id).map(|n| n.children.as_slice()).unwrap_or(&EMPTY)
    }

    /// Whether `ancestor` appears on `id`'s parent chain (a frame is not its
    /// own ancestor).
    pub fn is_ancestor(&self, ancestor: FrameId, id: FrameId) -> bool {
        let mut cur = self.parent_of(id);
        while let Some(fid) = cur {
            if fid == ancestor {
                return true;
            }
            cur = self.parent_of(fid);
        }
        false
    }

    /// Move a frame under a different parent, keeping its transform-to-parent.
    pub fn set_parent(&mut self, id: FrameId, new_parent: FrameId) -> Result<(), FrameError> {
        if !self.frames.contains_key(id) || !self.frames.contains_key(new_parent) {
            return Err(FrameError::UnknownFrame);
        }
        if id == self.world {
            return Err(FrameError::WorldFrame);
        }
        if id == new_parent || self.is_ancestor(id, new_parent) {
            return Err(FrameError::Cycle);
        }

        let old_parent = self.frames[id].parent;
        if let Some(op) = old_parent
            && let Some(node) = self.frames.get_mut(op)
        {
            node.children.retain(|&c| c != id);
        }
        self.frames[id].parent = Some(new_parent);
        self.frames[new_parent].children.push(id);
        self.mark_dirty(id);
        Ok(())
    }

    pub fn transform_to_parent(&self, id: FrameId) -> Option<&Isometry3<f64>> {
        self.frames.get(id).map(|n| &n.to_parent)
    }

    /// Replace a frame's transform-to-parent and dirty its subtree.
    pub fn set_transform_to_parent(
        &mut self,
        id: FrameId,
        to_parent: Isometry3<f64>,
    ) -> Result<(), FrameError> {
        self.update_transform(id, |t| *t = to_parent)
    }

    /// Mutate a frame's transform-to-parent in place. The subtree is dirtied
    /// after the mutator runs, so the next world-transform read of any
    /// descendant reflects the change exactly once.
    pub fn update_transform(
        &mut self,
        id: FrameId,
        mutator: impl FnOnce(&mut Isometry3<f64>),
    ) -> Result<(), FrameError> {
        if id == self.world {
            return Err(FrameError::WorldFrame);
        }
        let node = self.frames.get_mut(id).ok_or(FrameError::UnknownFrame)?;
        mutator(&mut node.to_parent);
        self.mark_dirty(id);
        Ok(())
    }

    /// Transform taking coordinates in `id` to world coordinates, composed
    /// from the ancestor chain. Clean frames return their memoized value.
    pub fn transform_to_world(&mut self, id: FrameId) -> Result<Isometry3<f64>, FrameError> {
        let (parent, dirty, cached, to_parent) = {
            let node = self.frames.get(id).ok_or(FrameError::UnknownFrame)?;
            (node.parent, node.dirty, node.cached_to_world, node.to_parent)
        };
        if !dirty {
            if let Some(cached) = cached {
                return Ok(cached);
            }
        }
        let to_world = match parent {
            None => to_parent,
            Some(p) => self.transform_to_world(p)? * to_parent,
        };
        if let Some(node) = self.frames.get_mut(id) {
            node.cached_to_world = Some(to_world);
            node.dirty = false;
        }
        Ok(to_world)
    }

    /// Transform taking coordinates in `from` to coordinates in `to`.
    pub fn transform_between(
        &mut self,
        from: FrameId,
        to: FrameId,
    ) -> Result<Isometry3<f64>, FrameError> {
        let world_from = self.transform_to_world(from)?;
        let world_to = self.transform_to_world(to)?;
        Ok(world_to.inverse() * world_from)
    }

    /// Dirty a frame and every descendant so their next read recomputes.
    fn mark_dirty(&mut self, id: FrameId) {
        let mut stack = vec![id];
        while let Some(fid) = stack.pop() {
            if let Some(node) = self.frames.get_mut(fid) {
                node.dirty = true;
                stack.extend(node.children.iter().copied());
            }
        }
    }
}
