use jobqueue_core::TaskId;

/// Redis键布局
///
/// | 键 | 类型 | 内容 |
/// |---|---|---|
/// | `{prefix}:id` | string | 自增ID |
/// | `{prefix}:task:{id}` | hash | 任务字段 |
/// | `{prefix}:ready:{profile}` | zset | 可执行任务，成员见 [`ready_entry`]，分数恒为0 |
/// | `{prefix}:delayed:{profile}` | zset | 未到调度时间的任务，分数为 `scheduled_at` |
/// | `{prefix}:running:{profile}` | set | 运行中的任务 |
/// | `{prefix}:members:{profile}` | set | profile 下的全部任务 |
/// | `{prefix}:claimed` | set | 已出队但尚未预留的任务 |
/// | `{prefix}:lock:{id}` | string | 预留标记 |
///
/// Lua脚本根据 `ARGV` 中的前缀在脚本内拼出键名，没有通过 `KEYS` 声明。
/// 因此只支持单机或主从部署的Redis，不支持Redis Cluster。
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn id_counter(&self) -> String {
        format!("{}:id", self.prefix)
    }

    pub fn task(&self, id: TaskId) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    pub fn ready(&self, profile: &str) -> String {
        format!("{}:ready:{}", self.prefix, profile)
    }

    pub fn delayed(&self, profile: &str) -> String {
        format!("{}:delayed:{}", self.prefix, profile)
    }

    pub fn running(&self, profile: &str) -> String {
        format!("{}:running:{}", self.prefix, profile)
    }

    pub fn members(&self, profile: &str) -> String {
        format!("{}:members:{}", self.prefix, profile)
    }

    pub fn claimed(&self) -> String {
        format!("{}:claimed", self.prefix)
    }

    pub fn lock(&self, id: TaskId) -> String {
        format!("{}:lock:{}", self.prefix, id)
    }
}

/// 有序集合成员：补零的ID，同分数时按字典序即ID升序
pub fn member(id: TaskId) -> String {
    format!("{id:020}")
}

pub fn parse_member(member: &str) -> Option<TaskId> {
    member.parse().ok()
}

/// 就绪索引成员
///
/// 三段定长十进制：取反的优先级、平移到无符号区间的创建时间、补零的ID。
/// 同分数的成员按字节序排列，即优先级降序、创建时间升序、ID升序，
/// 对整个 `i64` 范围都是精确的。末尾20位就是 [`member`]。
pub fn ready_entry(priority: i64, created_at: i64, id: TaskId) -> String {
    let priority = (i64::MAX as i128 - priority as i128) as u64;
    let created_at = (created_at as i128 - i64::MIN as i128) as u64;
    format!("{priority:020}:{created_at:020}:{}", member(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyBuilder::new("jq");
        assert_eq!(keys.id_counter(), "jq:id");
        assert_eq!(keys.task(42), "jq:task:42");
        assert_eq!(keys.ready("media"), "jq:ready:media");
        assert_eq!(keys.lock(42), "jq:lock:42");
    }

    #[test]
    fn test_member_ordering() {
        assert_eq!(member(7), "00000000000000000007");
        assert!(member(9) < member(10));
        assert_eq!(parse_member(&member(12345)), Some(12345));
    }

    #[test]
    fn test_ready_entry_ordering() {
        let now = 1_700_000_000;
        assert!(ready_entry(5, now + 100, 9) < ready_entry(1, now, 1));
        assert!(ready_entry(5, now, 9) < ready_entry(5, now + 1, 1));
        assert!(ready_entry(5, now, 1) < ready_entry(5, now, 2));
        assert!(ready_entry(-1, now, 1) > ready_entry(0, now, 1));
        assert!(ready_entry(i64::MAX, now, 1) < ready_entry(i64::MIN, now, 1));
        assert!(ready_entry(1, -1, 1) < ready_entry(1, 0, 1));
        assert!(ready_entry(1, now, 42).ends_with(&member(42)));
    }

    #[test]
    fn test_ready_entry_exact_for_large_priorities() {
        let base = 1_700_000_000;
        for priority in [1_000_000, 9_007_199_254_740_993, i64::MAX - 1] {
            for t in base..base + 10 {
                assert!(
                    ready_entry(priority, t, 1) < ready_entry(priority, t + 1, 1),
                    "priority {priority} at {t}"
                );
            }
            assert!(ready_entry(priority + 1, base + 10, 1) < ready_entry(priority, base, 1));
        }
    }
}
