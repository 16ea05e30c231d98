//! 索引节点锁表
//!
//! 每个被访问过的索引节点在表里有一个 [`InodeLock`]: 一把互斥锁加一个版本号.
//! 目录内容每次变化都会递增版本号, 遍历游标据此判断自己是否需要重新对齐到记录边界.
//!
//! 需要同时锁多个索引节点 (rename) 时必须经过 [`lock_ordered`]: 按索引节点号升序加锁,
//! 重复的只锁一次, 保证任意两个并发操作的加锁顺序一致.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use spin::{Mutex, MutexGuard};

pub struct InodeLock {
    ino: u32,
    lock: Mutex<()>,
    version: AtomicU64,
}

impl InodeLock {
    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// 目录内容发生变化
    pub fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Default)]
pub struct InodeLocks {
    table: Mutex<HashMap<u32, Arc<InodeLock>>>,
}

impl InodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ino: u32) -> Arc<InodeLock> {
        let mut table = self.table.lock();
        Arc::clone(table.entry(ino).or_insert_with(|| {
            Arc::new(InodeLock {
                ino,
                lock: Mutex::new(()),
                // 从 1 开始, 默认游标的版本号 0 一定需要对齐
                version: AtomicU64::new(1),
            })
        }))
    }

    /// 索引节点被回收后, 没人再引用的表项可以丢掉
    pub fn forget(&self, ino: u32) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get(&ino) {
            if Arc::strong_count(entry) == 1 {
                table.remove(&ino);
            }
        }
    }
}

/// 按顺序持有的一组锁, 离开作用域时全部释放
pub struct OrderedGuard<'a> {
    held: Vec<u32>,
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl OrderedGuard<'_> {
    pub fn holds(&self, ino: u32) -> bool {
        self.held.contains(&ino)
    }
}

pub fn lock_ordered<'a>(nodes: &[&'a InodeLock]) -> OrderedGuard<'a> {
    let mut sorted: Vec<&'a InodeLock> = nodes.to_vec();
    sorted.sort_by_key(|node| node.ino);
    sorted.dedup_by_key(|node| node.ino);
    let held = sorted.iter().map(|node| node.ino).collect();
    let guards = sorted.into_iter().map(|node| node.lock.lock()).collect();
    OrderedGuard {
        held,
        _guards: guards,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn duplicates_are_locked_once() {
        let locks = InodeLocks::new();
        let a = locks.get(7);
        let b = locks.get(3);
        let again = locks.get(7);
        let guard = lock_ordered(&[&*a, &*b, &*again]);
        assert!(guard.holds(3) && guard.holds(7));
        assert_eq!(guard.held, vec![3, 7]);
    }

    #[test]
    fn opposite_orders_do_not_deadlock() {
        let locks = Arc::new(InodeLocks::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let locks = Arc::clone(&locks);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let (x, y) = if i % 2 == 0 { (10, 20) } else { (20, 10) };
                        let a = locks.get(x);
                        let b = locks.get(y);
                        let _g = lock_ordered(&[&*a, &*b]);
                        a.bump();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(locks.get(10).version(), 1 + 1000);
        assert_eq!(locks.get(20).version(), 1 + 1000);
    }

    #[test]
    fn forget_keeps_entries_in_use() {
        let locks = InodeLocks::new();
        let held = locks.get(5);
        held.bump();
        locks.forget(5);
        assert_eq!(locks.get(5).version(), 2);
        drop(held);
        locks.forget(5);
        assert_eq!(locks.get(5).version(), 1);
    }
}
