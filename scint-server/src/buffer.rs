// 闪烁监测服务器 - 缓冲区管理
//
// 每路输入有一个原始读缓冲（只作一次读取的中转）和一个 peek 累积缓冲，
// 每路解输出有一个保存缓冲。所有缓冲容量在启动时固定，填充长度永不超过容量。

use crate::error::{Result, ServerError};
use common::Solution;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// 解记录环的容量
pub const SOLUTION_RING_SIZE: usize = 256;

/// 内存预算，启动和初始化时的每次分配都先经过它
pub trait MemoryBudget: Send + Sync {
    fn reserve(&self, what: &str, bytes: usize) -> Result<()>;
    fn release(&self, bytes: usize);
    fn in_use(&self) -> usize;
}

/// 无上限，只统计用量
#[derive(Debug, Default)]
pub struct UnboundedBudget {
    used: AtomicUsize,
}

impl MemoryBudget for UnboundedBudget {
    fn reserve(&self, _what: &str, bytes: usize) -> Result<()> {
        self.used.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn in_use(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// 有上限的预算
#[derive(Debug)]
pub struct LimitedBudget {
    limit: usize,
    used: AtomicUsize,
}

impl LimitedBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }
}

impl MemoryBudget for LimitedBudget {
    fn reserve(&self, what: &str, bytes: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.limit {
                return Err(ServerError::Allocation {
                    what: what.to_string(),
                    bytes,
                });
            }
            match self
                .used
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn in_use(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// 固定容量的字节缓冲及其填充长度
#[derive(Debug)]
pub struct ByteBuffer {
    data: Vec<u8>,
    len: usize,
}

impl ByteBuffer {
    /// 在预算内分配，失败时不留下任何占用
    pub fn allocate(budget: &dyn MemoryBudget, what: &str, capacity: usize) -> Result<Self> {
        budget.reserve(what, capacity)?;
        let mut data = Vec::new();
        if data.try_reserve_exact(capacity).is_err() {
            budget.release(capacity);
            return Err(ServerError::Allocation {
                what: what.to_string(),
                bytes: capacity,
            });
        }
        data.resize(capacity, 0);
        trace!("allocated {} ({} bytes)", what, capacity);
        Ok(Self { data, len: 0 })
    }

    /// 归还预算
    pub fn release(self, budget: &dyn MemoryBudget) {
        budget.release(self.data.len());
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// 复制尽可能多的字节，超出容量的部分丢弃，返回复制的字节数
    pub fn append_truncated(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// 读取前调用：写指针已到容量时立即回绕到 0，返回是否发生回绕
    pub fn prepare_fill(&mut self) -> bool {
        if self.is_full() {
            self.len = 0;
            true
        } else {
            false
        }
    }

    /// 写指针之后的空闲区
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    /// 取出全部内容并清空
    pub fn drain(&mut self) -> Vec<u8> {
        let out = self.as_slice().to_vec();
        self.len = 0;
        out
    }
}

/// 解记录环：写满后丢弃后续记录，不覆盖旧记录
#[derive(Debug)]
pub struct SolutionRing {
    items: Vec<Solution>,
    capacity: usize,
}

impl SolutionRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加一条记录，环已满时返回 false
    pub fn push(&mut self, solution: Solution) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push(solution);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[Solution] {
        &self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl Default for SolutionRing {
    fn default() -> Self {
        Self::new(SOLUTION_RING_SIZE)
    }
}
