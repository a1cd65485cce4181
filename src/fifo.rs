use std::collections::VecDeque;

/// Bounded first-in first-out queue used for every port in the hierarchy.
#[derive(Debug, Clone)]
pub struct Fifo<T> {
    inner: VecDeque<T>,
    pub max_size: Option<usize>,
}

impl<T> Fifo<T> {
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: VecDeque::new(),
            max_size,
        }
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.max_size
            .is_some_and(|max| self.inner.len() >= max)
    }

    /// Append; the caller must have checked [`Fifo::full`].
    pub fn enqueue(&mut self, value: T) {
        debug_assert!(!self.full());
        self.inner.push_back(value);
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.inner.front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::Fifo;

    #[test]
    fn bounded_fifo_preserves_order_and_capacity() {
        let mut fifo = Fifo::new(Some(2));
        fifo.enqueue(1);
        fifo.enqueue(2);
        assert!(fifo.full());
        assert_eq!(fifo.dequeue(), Some(1));
        assert!(!fifo.full());
        assert_eq!(fifo.dequeue(), Some(2));
        assert_eq!(fifo.dequeue(), None);
    }

    #[test]
    fn unbounded_fifo_never_fills() {
        let mut fifo = Fifo::new(None);
        for i in 0..1000 {
            assert!(!fifo.full());
            fifo.enqueue(i);
        }
        assert_eq!(fifo.len(), 1000);
    }
}
