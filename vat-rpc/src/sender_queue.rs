// An insertion-ordered queue of pending work items, each redeemable exactly
// once. The promise subsystem keeps one of these per pipelined-answer id and
// one per unresolved promise-export id; replaying a queue in insertion
// order, via `drain`, is what gives replay its ordering guarantee.

use futures::future::LocalBoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{canceled_to_error, Error};

use std::collections::BTreeMap;

struct Inner<In, Out>
where
    In: 'static,
    Out: 'static,
{
    next_id: u64,
    map: BTreeMap<u64, (In, oneshot::Sender<Out>)>,
}

/// A queue representing tasks that consume input of type `In` and produce output of
/// type `Out`.
pub struct SenderQueue<In, Out>
where
    In: 'static,
    Out: 'static,
{
    inner: Rc<RefCell<Inner<In, Out>>>,
}

impl<In, Out> Default for SenderQueue<In, Out>
where
    In: 'static,
    Out: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

pub struct Remover<In, Out>
where
    In: 'static,
    Out: 'static,
{
    id: u64,
    inner: Weak<RefCell<Inner<In, Out>>>,
}

impl<In, Out> Drop for Remover<In, Out>
where
    In: 'static,
    Out: 'static,
{
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let Inner { ref mut map, .. } = *inner.borrow_mut();
            map.remove(&self.id);
        }
    }
}

impl<In, Out> SenderQueue<In, Out>
where
    In: 'static,
    Out: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                next_id: 0,
                map: BTreeMap::new(),
            })),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().map.len()
    }

    /// Pushes `value` to the queue, returning a future that resolves after
    /// `value` is consumed on the other end of the queue (by `drain`). If
    /// the returned future is dropped first, `value` is removed from the
    /// queue instead of being delivered.
    pub fn push(&mut self, value: In) -> LocalBoxFuture<'static, Result<Out, Error>> {
        let weak_inner = Rc::downgrade(&self.inner);
        let Inner {
            ref mut next_id,
            ref mut map,
            ..
        } = *self.inner.borrow_mut();
        let (tx, rx) = oneshot::channel();
        let id = *next_id;
        map.insert(id, (value, tx));

        let remover = Remover {
            id,
            inner: weak_inner,
        };

        *next_id += 1;

        async move {
            let out = rx.await.map_err(canceled_to_error);
            drop(remover);
            out
        }
        .boxed_local()
    }

    /// Pushes `values` to the queue.
    pub fn push_detach(&mut self, value: In) {
        let Inner {
            ref mut next_id,
            ref mut map,
            ..
        } = *self.inner.borrow_mut();
        let (tx, _rx) = oneshot::channel();
        map.insert(*next_id, (value, tx));
        *next_id += 1;
    }

    pub fn drain(&mut self) -> Drain<In, Out> {
        let Inner {
            ref mut next_id,
            ref mut map,
            ..
        } = *self.inner.borrow_mut();
        *next_id = 0;
        let map = ::std::mem::take(map);
        Drain {
            iter: map.into_iter(),
        }
    }
}

pub struct Drain<In, Out>
where
    In: 'static,
    Out: 'static,
{
    iter: ::std::collections::btree_map::IntoIter<u64, (In, oneshot::Sender<Out>)>,
}

impl<In, Out> ::std::iter::Iterator for Drain<In, Out>
where
    In: 'static,
    Out: 'static,
{
    type Item = (In, oneshot::Sender<Out>);
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(_k, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_insertion_order() {
        let mut q: SenderQueue<u32, u32> = SenderQueue::new();
        let _f0 = q.push(10);
        let _f1 = q.push(20);
        let _f2 = q.push(30);
        let order: Vec<u32> = q
            .drain()
            .map(|(v, tx)| {
                let _ = tx.send(v);
                v
            })
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn dropped_future_removes_entry() {
        let mut q: SenderQueue<u32, u32> = SenderQueue::new();
        {
            let _f = q.push(1);
            assert_eq!(q.len(), 1);
        }
        assert_eq!(q.len(), 0);
    }
}
