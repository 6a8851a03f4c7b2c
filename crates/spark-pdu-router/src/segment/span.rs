//! 环形存储上的“按边界拆分”工具。
//!
//! 一段从 `start` 开始、长度为 `len` 的逻辑区间，落到容量为 `capacity` 的环上至多是两段连续区间：
//! 到末尾为止的线性部分，以及回绕到开头的剩余部分。显式拷贝与零拷贝路径都只经由这里计算区间。

use core::ops::Range;

/// 拆分结果：`head` 从 `start` 开始，`tail` 从 0 开始（可能为空）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrapSplit {
    pub head: Range<usize>,
    pub tail: Range<usize>,
}

impl WrapSplit {
    /// 两段总长度。
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    /// 是否为空区间。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 计算区间拆分。要求 `start < capacity` 且 `len <= capacity`。
pub fn split_at_boundary(capacity: usize, start: usize, len: usize) -> WrapSplit {
    debug_assert!(start < capacity && len <= capacity);
    let linear = len.min(capacity - start);
    WrapSplit {
        head: start..start + linear,
        tail: 0..len - linear,
    }
}

/// 将 `src` 从 `start` 处写入环形存储，返回新的写位置（已回绕）。
pub(crate) fn copy_in(storage: &mut [u8], start: usize, src: &[u8]) -> usize {
    let capacity = storage.len();
    let split = split_at_boundary(capacity, start, src.len());
    let (first, second) = src.split_at(split.head.len());
    storage[split.head.clone()].copy_from_slice(first);
    storage[split.tail.clone()].copy_from_slice(second);
    advance(capacity, start, src.len())
}

/// 从 `start` 处读出 `dst.len()` 字节，返回新的读位置（已回绕）。
pub(crate) fn copy_out(storage: &[u8], start: usize, dst: &mut [u8]) -> usize {
    let capacity = storage.len();
    let split = split_at_boundary(capacity, start, dst.len());
    let (first, second) = dst.split_at_mut(split.head.len());
    first.copy_from_slice(&storage[split.head.clone()]);
    second.copy_from_slice(&storage[split.tail.clone()]);
    advance(capacity, start, dst.len())
}

/// 游标前进 `len` 字节，到达末尾即回到开头。
pub(crate) fn advance(capacity: usize, position: usize, len: usize) -> usize {
    (position + len) % capacity
}
