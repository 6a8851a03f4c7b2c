//! 配置校验。
//!
//! 路由器运行期只对内部句柄做钳制式越界检查，真正的引用完整性在这里一次性确认：
//! 所有编号都指向存在的条目、目的地与路由互相登记、扇出不超过缓冲读者表、
//! 共享队列或共享缓冲的条目使用同一把锁。

use alloc::{
    format,
    string::{String, ToString},
};

use super::{LockMechanism, RouterConfig};
use crate::error::ConfigError;
use crate::ids::{BufferId, DestId, LockId, QueueId, RouteId};

impl RouterConfig {
    /// 校验整份配置，返回第一个发现的问题。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_count == 0 {
            return Err(invalid("router", "core_count must be at least 1"));
        }
        non_empty("locks", self.locks.len())?;
        non_empty("buffers", self.buffers.len())?;
        non_empty("queues", self.queues.len())?;
        non_empty("routes", self.routes.len())?;
        non_empty("destinations", self.destinations.len())?;
        for (table, len) in [
            ("locks", self.locks.len()),
            ("buffers", self.buffers.len()),
            ("queues", self.queues.len()),
            ("routes", self.routes.len()),
            ("destinations", self.destinations.len()),
        ] {
            if len > usize::from(u16::MAX) {
                return Err(invalid(table, "table exceeds 65535 entries"));
            }
        }

        self.validate_locks()?;
        self.validate_buffers()?;
        self.validate_queues()?;
        self.validate_routes()?;
        self.validate_destinations()?;
        self.validate_sharing()
    }

    fn validate_locks(&self) -> Result<(), ConfigError> {
        for (index, lock) in self.locks.iter().enumerate() {
            if let LockMechanism::Spinlock { retry_limit: 0 } = lock.mechanism {
                return Err(invalid(
                    LockId::new(index as u16),
                    "spinlock retry_limit must be at least 1",
                ));
            }
        }
        Ok(())
    }

    fn validate_buffers(&self) -> Result<(), ConfigError> {
        for (index, buffer) in self.buffers.iter().enumerate() {
            let owner = BufferId::new(index as u16);
            if buffer.capacity < 2 {
                return Err(invalid(owner, "capacity must be at least 2 bytes"));
            }
            if buffer.max_readers == 0 {
                return Err(invalid(owner, "max_readers must be at least 1"));
            }
        }
        Ok(())
    }

    fn validate_queues(&self) -> Result<(), ConfigError> {
        for (index, queue) in self.queues.iter().enumerate() {
            let owner = QueueId::new(index as u16);
            if queue.depth == 0 {
                return Err(invalid(owner, "depth must be at least 1"));
            }
            if queue.pool.is_empty() {
                return Err(invalid(owner, "buffer pool must not be empty"));
            }
            if self.lock(queue.lock).is_none() {
                return Err(dangling(owner, "lock", queue.lock));
            }
            for (position, buffer) in queue.pool.iter().enumerate() {
                if self.buffer(*buffer).is_none() {
                    return Err(dangling(owner, "pool", *buffer));
                }
                if queue.pool[..position].contains(buffer) {
                    return Err(invalid(owner, format!("{buffer} listed twice in pool")));
                }
            }
        }
        Ok(())
    }

    fn validate_routes(&self) -> Result<(), ConfigError> {
        for (index, route) in self.routes.iter().enumerate() {
            let owner = RouteId::new(index as u16);
            let Some(queue) = self.queue(route.queue) else {
                return Err(dangling(owner, "queue", route.queue));
            };
            if self.lock(route.lock).is_none() {
                return Err(dangling(owner, "lock", route.lock));
            }
            if route.destinations.is_empty() {
                return Err(invalid(owner, "at least one destination is required"));
            }
            for (position, dest) in route.destinations.iter().enumerate() {
                let Some(config) = self.destination(*dest) else {
                    return Err(dangling(owner, "destinations", *dest));
                };
                if config.route != owner {
                    return Err(invalid(
                        owner,
                        format!("{dest} is registered for {}", config.route),
                    ));
                }
                if route.destinations[..position].contains(dest) {
                    return Err(invalid(owner, format!("{dest} listed twice")));
                }
            }

            let fan_out = route.destinations.len();
            let mut largest_usable = 0;
            for buffer_id in &queue.pool {
                let Some(buffer) = self.buffer(*buffer_id) else {
                    continue;
                };
                if usize::from(buffer.max_readers) < fan_out {
                    return Err(invalid(
                        owner,
                        format!(
                            "fan-out {fan_out} exceeds max_readers {} of {buffer_id}",
                            buffer.max_readers
                        ),
                    ));
                }
                largest_usable = largest_usable.max(buffer.usable());
            }
            if route.minimum_buffer() > largest_usable {
                return Err(invalid(
                    owner,
                    format!(
                        "minimum buffer {} exceeds largest usable pool buffer {largest_usable}",
                        route.minimum_buffer()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn validate_destinations(&self) -> Result<(), ConfigError> {
        for (index, dest) in self.destinations.iter().enumerate() {
            let owner = DestId::new(index as u16);
            let Some(route) = self.route(dest.route) else {
                return Err(dangling(owner, "route", dest.route));
            };
            if !route.destinations.contains(&owner) {
                return Err(invalid(
                    owner,
                    format!("not listed by its route {}", dest.route),
                ));
            }
            if dest.partition.raw() >= self.core_count {
                return Err(dangling(owner, "partition", dest.partition));
            }
        }
        Ok(())
    }

    /// 共享规则：
    /// - 共用一个队列的路由必须使用同一把路由锁；
    /// - 共用一个缓冲的队列必须使用同一把队列锁。
    fn validate_sharing(&self) -> Result<(), ConfigError> {
        for (index, route) in self.routes.iter().enumerate() {
            for (other_index, other) in self.routes.iter().enumerate().skip(index + 1) {
                if route.queue == other.queue && route.lock != other.lock {
                    return Err(ConfigError::SharingViolation {
                        detail: format!(
                            "{} and {} share {} but use {} and {}",
                            RouteId::new(index as u16),
                            RouteId::new(other_index as u16),
                            route.queue,
                            route.lock,
                            other.lock
                        ),
                    });
                }
            }
        }
        for (index, queue) in self.queues.iter().enumerate() {
            for (other_index, other) in self.queues.iter().enumerate().skip(index + 1) {
                let shared = queue.pool.iter().find(|buffer| other.pool.contains(buffer));
                if let Some(buffer) = shared {
                    if queue.lock != other.lock {
                        return Err(ConfigError::SharingViolation {
                            detail: format!(
                                "{} and {} share {buffer} but use {} and {}",
                                QueueId::new(index as u16),
                                QueueId::new(other_index as u16),
                                queue.lock,
                                other.lock
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn non_empty(table: &'static str, len: usize) -> Result<(), ConfigError> {
    if len == 0 {
        Err(ConfigError::EmptyTable { table })
    } else {
        Ok(())
    }
}

fn invalid(owner: impl ToString, detail: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        owner: owner.to_string(),
        detail: detail.into(),
    }
}

fn dangling(owner: impl ToString, field: &'static str, target: impl ToString) -> ConfigError {
    ConfigError::DanglingReference {
        owner: owner.to_string(),
        field,
        target: target.to_string(),
    }
}
