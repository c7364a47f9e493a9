use color_eyre::Result;

/// A command list that can be cached and handed out again in a later cycle.
pub trait PooledCommandList {
    type Raw: Copy;

    /// Native command buffer the list records into.
    fn raw(&self) -> Self::Raw;

    /// Drops per-cycle state (pending transitions, bound pipeline) before
    /// the list is handed out again.
    fn recycle(&mut self);
}

/// Cache of command lists owned by one frame context.
///
/// Lists are moved out on checkout and moved back on checkin, so one list
/// can never be handed out twice at the same time. Storage only grows.
pub struct CommandListPool<L> {
    idle: Vec<L>,
    used: usize,
    capacity: usize,
}

impl<L: PooledCommandList> CommandListPool<L> {
    pub fn new() -> Self {
        Self {
            idle: Vec::new(),
            used: 0,
            capacity: 0,
        }
    }

    /// Hands out an idle cached list, or one built by `create` when every
    /// cached list is in use.
    pub fn checkout<F>(&mut self, create: F) -> Result<L>
    where
        F: FnOnce() -> Result<L>,
    {
        let list = match self.idle.pop() {
            Some(mut list) => {
                list.recycle();
                list
            }
            None => {
                let list = create()?;
                self.capacity += 1;
                log::debug!("Command list cache grew to {}", self.capacity);
                list
            }
        };
        self.used += 1;
        Ok(list)
    }

    pub fn checkin(&mut self, list: L) {
        self.idle.push(list);
    }

    pub fn reset_for_new_cycle(&mut self) {
        self.used = 0;
    }

    /// Lists handed out since the last reset.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Lists ever created by this pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}

impl<L: PooledCommandList> Default for CommandListPool<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    struct FakeList {
        id: u32,
        recycled: u32,
    }

    impl PooledCommandList for FakeList {
        type Raw = u32;

        fn raw(&self) -> u32 {
            self.id
        }

        fn recycle(&mut self) {
            self.recycled += 1;
        }
    }

    fn fake(id: u32) -> impl FnOnce() -> Result<FakeList> {
        move || Ok(FakeList { id, recycled: 0 })
    }

    #[test]
    fn checkout_grows_only_when_empty() {
        let mut pool = CommandListPool::new();

        let a = pool.checkout(fake(1)).unwrap();
        let b = pool.checkout(fake(2)).unwrap();
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.used(), 2);

        pool.checkin(a);
        pool.checkin(b);
        pool.reset_for_new_cycle();
        assert_eq!(pool.used(), 0);

        let c = pool.checkout(|| Err(eyre!("must reuse a cached list"))).unwrap();
        assert_eq!(c.recycled, 1);
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.used(), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn steady_state_reuses_the_same_list() {
        let mut pool = CommandListPool::new();
        for cycle in 0..5 {
            pool.reset_for_new_cycle();
            let list = pool.checkout(fake(cycle)).unwrap();
            assert_eq!(list.raw(), 0);
            pool.checkin(list);
        }
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn failed_creation_leaves_pool_untouched() {
        let mut pool: CommandListPool<FakeList> = CommandListPool::new();
        assert!(pool.checkout(|| Err(eyre!("out of memory"))).is_err());
        assert_eq!(pool.capacity(), 0);
        assert_eq!(pool.used(), 0);
    }
}
