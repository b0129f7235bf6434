//! Splay-tree page table keyed by VMA base address.
//!
//! Grounded on `sp_tree.c` (top-down splay, Sleator & Tarjan 1985) for
//! `insert`/`find_and_lock`/`remove`, and on the sibling `splay.c` for the
//! stateful in-order `next()` cursor that `sp_tree.c` itself does not
//! implement. Locking discipline matches `sp_tree.c` exactly: a tree-wide
//! lock serializes structural changes; `find_and_lock` splays under that
//! lock, then locks the found VMA and releases the tree lock, leaving the
//! VMA locked for the caller.

use std::ptr::NonNull;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{OocError, Result};
use crate::memory::node_alloc::Pool;
use crate::memory::vma::Vma;

struct PageTableNode {
    parent: Option<NonNull<PageTableNode>>,
    left: Option<NonNull<PageTableNode>>,
    right: Option<NonNull<PageTableNode>>,
    vma: Vma,
}

struct Tree {
    root: Option<NonNull<PageTableNode>>,
    /// Cursor for the stateful `next()` walk.
    cursor: Option<NonNull<PageTableNode>>,
}

unsafe impl Send for Tree {}

lazy_static! {
    static ref NODES: Pool<PageTableNode> = Pool::new();
    static ref TREE: Mutex<Tree> = Mutex::new(Tree {
        root: None,
        cursor: None,
    });
}

fn node_start(n: NonNull<PageTableNode>) -> usize {
    unsafe { n.as_ref().vma.start }
}

/// Top-down splay of `root` towards `key`, leaving the closest node (either
/// an exact match or its in-order neighbor) at the root. Mirrors
/// `sp_tree_splay`'s `MAKE_CHILD`-based rewiring using `Option<NonNull<_>>`
/// child slots instead of raw pointers with sentinel NULLs.
unsafe fn splay(mut t: NonNull<PageTableNode>, key: usize) -> NonNull<PageTableNode> {
    // `l_head`/`l_tail` thread together every node known to be < key (via
    // `.right` links), `r_head`/`r_tail` every node known to be > key (via
    // `.left` links). At the end the two chains are grafted onto the
    // found node's left and right children respectively.
    let mut l_head: Option<NonNull<PageTableNode>> = None;
    let mut l_tail: Option<NonNull<PageTableNode>> = None;
    let mut r_head: Option<NonNull<PageTableNode>> = None;
    let mut r_tail: Option<NonNull<PageTableNode>> = None;

    loop {
        let start = node_start(t);
        if key < start {
            let Some(mut l) = t.as_ref().left else { break };
            if key < node_start(l) {
                // rotate right
                t.as_mut().left = l.as_ref().right;
                if let Some(mut lr) = l.as_ref().right {
                    lr.as_mut().parent = Some(t);
                }
                l.as_mut().right = Some(t);
                t.as_mut().parent = Some(l);
                t = l;
                let Some(new_l) = t.as_ref().left else { break };
                l = new_l;
            }
            match r_tail {
                Some(mut rt) => {
                    rt.as_mut().left = Some(t);
                    t.as_mut().parent = Some(rt);
                }
                None => r_head = Some(t),
            }
            r_tail = Some(t);
            t = l;
        } else if key > start {
            let Some(mut r) = t.as_ref().right else { break };
            if key > node_start(r) {
                // rotate left
                t.as_mut().right = r.as_ref().left;
                if let Some(mut rl) = r.as_ref().left {
                    rl.as_mut().parent = Some(t);
                }
                r.as_mut().left = Some(t);
                t.as_mut().parent = Some(r);
                t = r;
                let Some(new_r) = t.as_ref().right else { break };
                r = new_r;
            }
            match l_tail {
                Some(mut lt) => {
                    lt.as_mut().right = Some(t);
                    t.as_mut().parent = Some(lt);
                }
                None => l_head = Some(t),
            }
            l_tail = Some(t);
            t = r;
        } else {
            break;
        }
    }

    // Graft: everything collected in the left chain becomes t's new left
    // subtree (capped by t's own original left child), and symmetrically
    // for the right chain.
    if let Some(mut lt) = l_tail {
        lt.as_mut().right = t.as_ref().left;
        if let Some(mut tl) = t.as_ref().left {
            tl.as_mut().parent = Some(lt);
        }
    }
    if let Some(mut rt) = r_tail {
        rt.as_mut().left = t.as_ref().right;
        if let Some(mut tr) = t.as_ref().right {
            tr.as_mut().parent = Some(rt);
        }
    }
    t.as_mut().left = l_head;
    if let Some(mut l) = l_head {
        l.as_mut().parent = Some(t);
    }
    t.as_mut().right = r_head;
    if let Some(mut r) = r_head {
        r.as_mut().parent = Some(t);
    }
    t.as_mut().parent = None;
    t
}

/// Registers a new VMA at `[start, start + size)`. Fails if any existing
/// VMA overlaps the new range.
pub(crate) fn insert(start: usize, size: usize, backing: crate::memory::vma::Backing) -> Result<()> {
    let mut tree = TREE.lock();

    if let Some(root) = tree.root {
        let splayed = unsafe { splay(root, start) };
        tree.root = Some(splayed);
        let existing = node_start(splayed);
        if existing == start {
            let end = unsafe { splayed.as_ref().vma.end() };
            return Err(OocError::DuplicateVma { start, end });
        }
    }

    let slot = NODES.alloc()?;
    unsafe {
        std::ptr::write(
            slot.as_ptr(),
            PageTableNode {
                parent: None,
                left: None,
                right: None,
                vma: Vma::new(start, size, backing),
            },
        );
    }

    match tree.root {
        None => {
            tree.root = Some(slot);
        }
        Some(mut splayed) => {
            let mut new_node = slot;
            if start < node_start(splayed) {
                unsafe {
                    new_node.as_mut().left = splayed.as_ref().left;
                    if let Some(mut l) = new_node.as_ref().left {
                        l.as_mut().parent = Some(new_node);
                    }
                    new_node.as_mut().right = Some(splayed);
                    splayed.as_mut().left = None;
                    splayed.as_mut().parent = Some(new_node);
                }
            } else {
                unsafe {
                    new_node.as_mut().right = splayed.as_ref().right;
                    if let Some(mut r) = new_node.as_ref().right {
                        r.as_mut().parent = Some(new_node);
                    }
                    new_node.as_mut().left = Some(splayed);
                    splayed.as_mut().right = None;
                    splayed.as_mut().parent = Some(new_node);
                }
            }
            tree.root = Some(new_node);
        }
    }
    Ok(())
}

/// Splays on `addr` and returns the VMA covering it, locked, or `None` if
/// no registered VMA covers `addr`. The tree lock is released before
/// returning; the VMA lock is held by the caller afterwards and must be
/// released with `Vma::unlock`.
///
/// An unsuccessful top-down splay search for `addr` lands on either its
/// in-order predecessor or its in-order successor, depending on which side
/// of the search path ran out of children first — not always the
/// predecessor. If the splayed root doesn't cover `addr`, the predecessor
/// (the rightmost node of the root's now-left subtree) is the only other
/// candidate that could, and is checked before giving up.
pub(crate) fn find_and_lock(addr: usize) -> Option<&'static Vma> {
    let mut tree = TREE.lock();
    let root = tree.root?;
    let splayed = unsafe { splay(root, addr) };
    tree.root = Some(splayed);

    let vma: &'static Vma = unsafe { &(*splayed.as_ptr()).vma };
    if vma.contains(addr) {
        vma.lock();
        return Some(vma);
    }

    let pred = unsafe { splayed.as_ref().left }.map(rightmost)?;
    let pred_vma: &'static Vma = unsafe { &(*pred.as_ptr()).vma };
    if !pred_vma.contains(addr) {
        return None;
    }
    pred_vma.lock();
    Some(pred_vma)
}

/// Removes the VMA that starts exactly at `start`.
pub(crate) fn remove(start: usize) -> Result<()> {
    let mut tree = TREE.lock();
    let Some(root) = tree.root else {
        return Err(OocError::VmaNotFound { addr: start });
    };
    let splayed = unsafe { splay(root, start) };
    if node_start(splayed) != start {
        tree.root = Some(splayed);
        return Err(OocError::VmaNotFound { addr: start });
    }

    let left = unsafe { splayed.as_ref().left };
    let right = unsafe { splayed.as_ref().right };

    let new_root = match (left, right) {
        (None, r) => r,
        (Some(mut l), None) => {
            l.as_mut().parent = None;
            Some(l)
        }
        (Some(mut l), Some(mut r)) => {
            l.as_mut().parent = None;
            let new_l = unsafe { splay(l, start) };
            // new_l has no right child: every key under `left` is < start.
            let mut nl = new_l;
            unsafe {
                nl.as_mut().right = Some(r);
                r.as_mut().parent = Some(nl);
            }
            Some(nl)
        }
    };
    if tree.cursor == Some(splayed) {
        tree.cursor = None;
    }
    tree.root = new_root;

    if let Some(mut nr) = tree.root {
        nr.as_mut().parent = None;
    }

    unsafe {
        NODES.free(splayed);
    }
    Ok(())
}

/// `true` if no VMAs are registered.
pub fn empty() -> bool {
    TREE.lock().root.is_none()
}

/// Advances the stateful in-order cursor and returns the VMA it now points
/// at, or `None` once the walk is exhausted (after which the next call
/// restarts from the leftmost node). Grounded on `splay.c`'s `ooc_sp_next`.
pub fn next() -> Option<&'static Vma> {
    let mut tree = TREE.lock();
    let current = match tree.cursor {
        None => leftmost(tree.root?),
        Some(cur) => unsafe {
            if let Some(r) = cur.as_ref().right {
                leftmost(r)
            } else {
                let mut node = cur;
                loop {
                    let parent = node.as_ref().parent?;
                    if parent.as_ref().left == Some(node) {
                        break parent;
                    }
                    node = parent;
                }
            }
        },
    };
    tree.cursor = Some(current);
    Some(unsafe { &(*current.as_ptr()).vma })
}

fn rightmost(mut n: NonNull<PageTableNode>) -> NonNull<PageTableNode> {
    unsafe {
        while let Some(r) = n.as_ref().right {
            n = r;
        }
    }
    n
}

fn leftmost(mut n: NonNull<PageTableNode>) -> NonNull<PageTableNode> {
    unsafe {
        while let Some(l) = n.as_ref().left {
            n = l;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    lazy_static! {
        static ref GUARD: StdMutex<()> = StdMutex::new(());
    }

    fn reset() {
        while !empty() {
            let addr = {
                let mut tree = TREE.lock();
                tree.root.map(node_start)
            };
            if let Some(a) = addr {
                remove(a).unwrap();
            } else {
                break;
            }
        }
    }

    #[test]
    fn insert_find_remove() {
        let _g = GUARD.lock().unwrap();
        reset();
        let page = 4096;
        for i in 0..100 {
            insert(i * page, page, crate::memory::vma::Backing::Anonymous).unwrap();
        }
        assert!(insert(5 * page, page, crate::memory::vma::Backing::Anonymous).is_err());

        for i in 0..100 {
            let vma = find_and_lock(i * page + 10).expect("found");
            assert_eq!(vma.start, i * page);
            vma.unlock();
        }

        assert!(find_and_lock(100 * page + 10).is_none());
        assert!(remove(100 * page).is_err());

        for i in 0..100 {
            remove(i * page).unwrap();
        }
        assert!(empty());
    }

    /// Regression for an unsuccessful splay search landing on `addr`'s
    /// in-order *successor* instead of its predecessor: insert order
    /// `0, 100, 50` splays `50` to the root with `0` as its left child and
    /// `100` as its right child, so querying `addr = 75` (covered by `50`'s
    /// `[50, 80)`) must first splay to `100` (the successor, not covering
    /// 75), then fall back to the rightmost node of the left subtree — `50`
    /// — rather than reporting "not found" for a live VMA.
    #[test]
    fn find_and_lock_finds_predecessor_after_landing_on_successor() {
        let _g = GUARD.lock().unwrap();
        reset();
        insert(0, 30, crate::memory::vma::Backing::Anonymous).unwrap();
        insert(100, 30, crate::memory::vma::Backing::Anonymous).unwrap();
        insert(50, 30, crate::memory::vma::Backing::Anonymous).unwrap();

        let vma = find_and_lock(75).expect("75 is covered by the VMA based at 50");
        assert_eq!(vma.start, 50);
        vma.unlock();

        assert!(find_and_lock(90).is_none());

        remove(0).unwrap();
        remove(50).unwrap();
        remove(100).unwrap();
        assert!(empty());
    }

    #[test]
    fn in_order_cursor() {
        let _g = GUARD.lock().unwrap();
        reset();
        let page = 4096;
        for i in [3, 1, 4, 1_usize + 5, 9, 2, 6].into_iter().enumerate() {
            let (_, v) = i;
            let start = v * page + 1000 * page;
            if find_and_lock(start).is_none() {
                let _ = insert(start, page, crate::memory::vma::Backing::Anonymous);
            }
        }
        let mut seen = Vec::new();
        while let Some(vma) = next() {
            seen.push(vma.start);
            if seen.len() > 16 {
                break;
            }
        }
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
        reset();
    }
}
