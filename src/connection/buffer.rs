//! 复制缓冲区池
//! 中继的每个复制循环从池中借出一块定长缓冲区，结束后归还复用

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use bytes::BytesMut;
use parking_lot::Mutex;

/// 默认缓冲区大小（32 KiB）
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// 默认池中最多保留的空闲缓冲区数量
const DEFAULT_MAX_POOLED: usize = 256;

/// 定长缓冲区池
#[derive(Debug)]
pub struct BufferPool {
    /// 每块缓冲区的大小
    chunk_size: usize,
    /// 最多保留的空闲缓冲区数量
    max_pooled: usize,
    /// 空闲缓冲区
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// 创建新的缓冲区池
    pub fn new(chunk_size: usize, max_pooled: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_pooled,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 当前空闲缓冲区数量
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// 借出一块缓冲区，归还在 drop 时自动完成
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::zeroed(self.chunk_size));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, buf: BytesMut) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_MAX_POOLED)
    }
}

/// 从池中借出的缓冲区
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}
