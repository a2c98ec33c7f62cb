//! 队列操作的Lua脚本
//!
//! 出队、预留、更新、删除、清空和恢复都在单个脚本内完成，
//! Redis串行执行脚本，每个操作都是一个原子决策点。
//! 所有脚本的 `ARGV[1]` 都是键前缀，键名在脚本内拼出（仅支持非Cluster部署）。
//! 就绪集合的分数恒为0，顺序完全由 `rank` 字段保存的成员字节序决定。

use redis::Script;

/// 公共函数：成员转ID、按调度时间建立索引、清除任务
const PRELUDE: &str = r#"
local function id_of(member)
  return (string.gsub(member, '^0+', ''))
end

local function member_of(entry)
  return string.sub(entry, -20)
end

local function index(prefix, task, member, profile, now)
  local scheduled = tonumber(redis.call('HGET', task, 'scheduled_at'))
  if scheduled and scheduled > now then
    redis.call('ZADD', prefix .. ':delayed:' .. profile, scheduled, member)
  else
    redis.call('ZADD', prefix .. ':ready:' .. profile, 0, redis.call('HGET', task, 'rank'))
  end
end

local function unindex(prefix, task, member, profile)
  local entry = redis.call('HGET', task, 'rank')
  if entry then
    redis.call('ZREM', prefix .. ':ready:' .. profile, entry)
  end
  redis.call('ZREM', prefix .. ':delayed:' .. profile, member)
  redis.call('SREM', prefix .. ':running:' .. profile, member)
end

local function purge(prefix, id, member, profile)
  unindex(prefix, prefix .. ':task:' .. id, member, profile)
  redis.call('SREM', prefix .. ':members:' .. profile, member)
  redis.call('SREM', prefix .. ':claimed', member)
  redis.call('DEL', prefix .. ':task:' .. id, prefix .. ':lock:' .. id)
end
"#;

/// ARGV: prefix, id, member, now, field, value, ...
const ADD: &str = r#"
local prefix, id, member, now = ARGV[1], ARGV[2], ARGV[3], tonumber(ARGV[4])
local task = prefix .. ':task:' .. id
local fields = {}
for i = 5, #ARGV do fields[#fields + 1] = ARGV[i] end
redis.call('HSET', task, unpack(fields))
local profile = redis.call('HGET', task, 'profile')
redis.call('SADD', prefix .. ':members:' .. profile, member)
index(prefix, task, member, profile, now)
return 1
"#;

/// ARGV: prefix, now, profile, ...
///
/// 先把到期的延迟任务移入就绪集合，再在所有 profile 的队首中选出
/// 字节序最小的就绪成员，移出就绪集合并记为已出队，返回任务成员。
const GET_NEXT: &str = r#"
local prefix, now = ARGV[1], tonumber(ARGV[2])
local best_entry, best_profile = nil, nil
for i = 3, #ARGV do
  local profile = ARGV[i]
  local ready = prefix .. ':ready:' .. profile
  local delayed = prefix .. ':delayed:' .. profile
  for _, member in ipairs(redis.call('ZRANGEBYSCORE', delayed, '-inf', now)) do
    redis.call('ZREM', delayed, member)
    local entry = redis.call('HGET', prefix .. ':task:' .. id_of(member), 'rank')
    if entry then
      redis.call('ZADD', ready, 0, entry)
    end
  end
  local head = redis.call('ZRANGE', ready, 0, 0)
  if head[1] and (best_entry == nil or head[1] < best_entry) then
    best_entry, best_profile = head[1], profile
  end
end
if not best_entry then
  return false
end
local member = member_of(best_entry)
redis.call('ZREM', prefix .. ':ready:' .. best_profile, best_entry)
redis.call('SADD', prefix .. ':claimed', member)
return member
"#;

/// ARGV: prefix, id, member, token
const FLAG: &str = r#"
local prefix, id, member, token = ARGV[1], ARGV[2], ARGV[3], ARGV[4]
local task = prefix .. ':task:' .. id
if redis.call('HGET', task, 'status') ~= 'waiting' then
  return 0
end
if not redis.call('SET', prefix .. ':lock:' .. id, token, 'NX') then
  return 0
end
local profile = redis.call('HGET', task, 'profile')
redis.call('ZREM', prefix .. ':ready:' .. profile, redis.call('HGET', task, 'rank'))
redis.call('ZREM', prefix .. ':delayed:' .. profile, member)
redis.call('SREM', prefix .. ':claimed', member)
return 1
"#;

/// ARGV: prefix, id, member, now, field, value, ...
///
/// 只写入传入的字段，未传入的字段保留其他写入方的值。返回 -1 表示任务不存在。
const UPDATE: &str = r#"
local prefix, id, member, now = ARGV[1], ARGV[2], ARGV[3], tonumber(ARGV[4])
local task = prefix .. ':task:' .. id
local old = redis.call('HGET', task, 'profile')
if not old then
  return -1
end
unindex(prefix, task, member, old)
redis.call('SREM', prefix .. ':members:' .. old, member)

local fields = {}
for i = 5, #ARGV do fields[#fields + 1] = ARGV[i] end
if #fields > 0 then
  redis.call('HSET', task, unpack(fields))
end

local profile = redis.call('HGET', task, 'profile')
local status = redis.call('HGET', task, 'status')
local lock = prefix .. ':lock:' .. id
local claimed = prefix .. ':claimed'
redis.call('SADD', prefix .. ':members:' .. profile, member)

if status == 'waiting' then
  if redis.call('EXISTS', lock) == 0 and redis.call('SISMEMBER', claimed, member) == 0 then
    index(prefix, task, member, profile, now)
  end
elseif status == 'running' then
  redis.call('SADD', prefix .. ':running:' .. profile, member)
else
  redis.call('DEL', lock)
  redis.call('SREM', claimed, member)
end
return 1
"#;

/// ARGV: prefix, id, member
const REMOVE: &str = r#"
local prefix, id, member = ARGV[1], ARGV[2], ARGV[3]
local profile = redis.call('HGET', prefix .. ':task:' .. id, 'profile')
if not profile then
  return 0
end
purge(prefix, id, member, profile)
return 1
"#;

/// ARGV: prefix, profile, ...
///
/// 已出队或已预留的任务不会被清除。
const FLUSH: &str = r#"
local prefix = ARGV[1]
local removed = 0
for i = 2, #ARGV do
  local profile = ARGV[i]
  local members = prefix .. ':members:' .. profile
  for _, member in ipairs(redis.call('SMEMBERS', members)) do
    local id = id_of(member)
    local status = redis.call('HGET', prefix .. ':task:' .. id, 'status')
    if not status then
      redis.call('SREM', members, member)
    elseif (status == 'waiting' or status == 'pending')
        and redis.call('EXISTS', prefix .. ':lock:' .. id) == 0
        and redis.call('SISMEMBER', prefix .. ':claimed', member) == 0 then
      purge(prefix, id, member, profile)
      removed = removed + 1
    end
  end
end
return removed
"#;

/// ARGV: prefix, now, profile, ...
///
/// 运行中的任务重置为 waiting；已出队或已预留但仍是 waiting 的任务重新入索引。
const REBOOT: &str = r#"
local prefix, now = ARGV[1], tonumber(ARGV[2])
local claimed = prefix .. ':claimed'
local restored = 0
for i = 3, #ARGV do
  local profile = ARGV[i]
  for _, member in ipairs(redis.call('SMEMBERS', prefix .. ':members:' .. profile)) do
    local id = id_of(member)
    local task = prefix .. ':task:' .. id
    local lock = prefix .. ':lock:' .. id
    local status = redis.call('HGET', task, 'status')
    local stuck = false
    if status == 'running' then
      redis.call('HSET', task, 'status', 'waiting')
      stuck = true
    elseif status == 'waiting'
        and (redis.call('EXISTS', lock) == 1 or redis.call('SISMEMBER', claimed, member) == 1) then
      stuck = true
    end
    if stuck then
      redis.call('DEL', lock)
      redis.call('SREM', claimed, member)
      unindex(prefix, task, member, profile)
      index(prefix, task, member, profile, now)
      restored = restored + 1
    end
  end
end
return restored
"#;

#[derive(Debug, Clone)]
pub struct Scripts {
    pub add: Script,
    pub get_next: Script,
    pub flag: Script,
    pub update: Script,
    pub remove: Script,
    pub flush: Script,
    pub reboot: Script,
}

impl Scripts {
    pub fn load() -> Self {
        let script = |body: &str| Script::new(&format!("{PRELUDE}{body}"));
        Self {
            add: script(ADD),
            get_next: script(GET_NEXT),
            flag: script(FLAG),
            update: script(UPDATE),
            remove: script(REMOVE),
            flush: script(FLUSH),
            reboot: script(REBOOT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_queue::keys::KeyBuilder;

    const ALL: [&str; 8] = [PRELUDE, ADD, GET_NEXT, FLAG, UPDATE, REMOVE, FLUSH, REBOOT];

    #[test]
    fn test_scripts_derive_keys_from_prefix() {
        for body in ALL {
            assert!(!body.contains("KEYS["), "{body}");
        }

        // 脚本拼出的键名与 KeyBuilder 的布局一致
        let keys = KeyBuilder::new("p");
        let fragments = [
            (keys.task(1), "':task:'"),
            (keys.ready("m"), "':ready:'"),
            (keys.delayed("m"), "':delayed:'"),
            (keys.running("m"), "':running:'"),
            (keys.members("m"), "':members:'"),
            (keys.lock(1), "':lock:'"),
        ];
        for (key, fragment) in fragments {
            let infix = fragment.trim_matches('\'');
            assert!(key.starts_with(&format!("p{infix}")), "{key}");
            assert!(ALL.iter().any(|body| body.contains(fragment)), "{fragment}");
        }
        assert_eq!(keys.claimed(), "p:claimed");
        assert!(ALL.iter().any(|body| body.contains("prefix .. ':claimed'")));
    }
}
