//! 句柄类型：以新类型包装的小整数索引。
//!
//! # 设计动机（Why）
//! - 配置表中的缓冲、队列、路由、目的地、锁都按下标寻址；若直接传递 `usize`，
//!   很容易把“缓冲编号”误传为“队列编号”而编译器无从察觉。
//! - 每种句柄都是独立类型，只能在其所属集合上使用，越界检查集中在各管理器内部完成。
//!
//! # 契约（What）
//! - 句柄本身不保证有效，只是一个带类型的编号；有效性由持有对应集合的管理器在每次使用时校验。
//! - 所有句柄均为 `Copy`，可序列化为裸整数，便于在 TOML 配置中直接书写。

use core::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u16);

        impl $name {
            /// 由原始编号构造句柄。
            pub const fn new(raw: u16) -> Self {
                Self(raw)
            }

            /// 返回原始编号。
            pub const fn raw(self) -> u16 {
                self.0
            }

            /// 以 `usize` 形式返回编号，供集合下标使用。
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

define_handle!(
    /// 分段环形缓冲编号。
    BufferId,
    "buffer"
);
define_handle!(
    /// FIFO 队列编号。
    QueueId,
    "queue"
);
define_handle!(
    /// 源路由编号，每条路由对应一个接收状态机实例。
    RouteId,
    "route"
);
define_handle!(
    /// 目的地编号，每个目的地对应一个发送状态机实例。
    DestId,
    "dest"
);
define_handle!(
    /// 锁编号。
    LockId,
    "lock"
);
define_handle!(
    /// 核心（并发分区）编号。
    CoreId,
    "core"
);

/// FIFO 槽位引用：所属队列加上槽位下标。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    queue: QueueId,
    index: u16,
}

impl SlotRef {
    /// 构造槽位引用。
    pub const fn new(queue: QueueId, index: u16) -> Self {
        Self { queue, index }
    }

    /// 所属队列。
    pub const fn queue(self) -> QueueId {
        self.queue
    }

    /// 槽位在队列环中的下标。
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/slot#{}", self.queue, self.index)
    }
}

/// 读实例引用：某个缓冲上的一条读游标。
///
/// 读实例只在目的地开始读取时创建，读取结束或传输中止时销毁；
/// 同一 `(缓冲, 目的地)` 组合至多存在一个实例。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReaderId {
    buffer: BufferId,
    index: u8,
}

impl ReaderId {
    /// 构造读实例引用。
    pub const fn new(buffer: BufferId, index: u8) -> Self {
        Self { buffer, index }
    }

    /// 被读取的缓冲。
    pub const fn buffer(self) -> BufferId {
        self.buffer
    }

    /// 读游标在缓冲读者表中的下标。
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/reader#{}", self.buffer, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn handles_render_with_kind_prefix() {
        assert_eq!(BufferId::new(3).to_string(), "buffer#3");
        assert_eq!(SlotRef::new(QueueId::new(1), 2).to_string(), "queue#1/slot#2");
        assert_eq!(
            ReaderId::new(BufferId::new(0), 4).to_string(),
            "buffer#0/reader#4"
        );
    }
}
