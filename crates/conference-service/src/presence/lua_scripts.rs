//! Lua scripts for the Redis presence backend.
//!
//! Each script touches a connection's binding key and its meeting's
//! participant hash in one atomic step, so a removal racing another removal
//! (or a toggle) can never observe a half-deleted participant.
//!
//! Key layout:
//! - `connection:{connection_id}:meeting` - owning meeting id (STRING)
//! - `meeting:{meeting_id}:participants` - connection id -> participant JSON (HASH)

/// Register a participant, detaching the connection from any previous meeting.
///
/// Arguments:
/// - KEYS[1]: Connection binding key
/// - KEYS[2]: Target meeting participant hash
/// - ARGV[1]: Connection id
/// - ARGV[2]: Meeting id
/// - ARGV[3]: Participant JSON
///
/// Returns 1.
pub const ADD_PARTICIPANT: &str = r"
local previous = redis.call('GET', KEYS[1])
if previous and previous ~= ARGV[2] then
    redis.call('HDEL', 'meeting:' .. previous .. ':participants', ARGV[1])
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('SET', KEYS[1], ARGV[2])
return 1
";

/// Remove a connection's participant and binding.
///
/// Arguments:
/// - KEYS[1]: Connection binding key
/// - ARGV[1]: Connection id
///
/// Returns `{meeting_id, participant_json}`, or nil if not registered.
pub const REMOVE_PARTICIPANT: &str = r"
local meeting = redis.call('GET', KEYS[1])
if not meeting then
    return false
end
redis.call('DEL', KEYS[1])
local key = 'meeting:' .. meeting .. ':participants'
local participant = redis.call('HGET', key, ARGV[1])
if not participant then
    return false
end
redis.call('HDEL', key, ARGV[1])
return {meeting, participant}
";

/// Read a connection's participant.
///
/// Arguments:
/// - KEYS[1]: Connection binding key
/// - ARGV[1]: Connection id
///
/// Returns `{meeting_id, participant_json}`, or nil if not registered.
pub const LOOKUP_PARTICIPANT: &str = r"
local meeting = redis.call('GET', KEYS[1])
if not meeting then
    return false
end
local participant = redis.call('HGET', 'meeting:' .. meeting .. ':participants', ARGV[1])
if not participant then
    return false
end
return {meeting, participant}
";

/// Set one boolean flag on a connection's participant.
///
/// Arguments:
/// - KEYS[1]: Connection binding key
/// - ARGV[1]: Connection id
/// - ARGV[2]: Flag field name (`isMuted` or `isVideoOff`)
/// - ARGV[3]: `1` for true, `0` for false
///
/// Returns `{meeting_id, updated_participant_json}`, or nil if not registered.
pub const UPDATE_PARTICIPANT_FLAG: &str = r"
local meeting = redis.call('GET', KEYS[1])
if not meeting then
    return false
end
local key = 'meeting:' .. meeting .. ':participants'
local raw = redis.call('HGET', key, ARGV[1])
if not raw then
    return false
end
local participant = cjson.decode(raw)
participant[ARGV[2]] = (ARGV[3] == '1')
local encoded = cjson.encode(participant)
redis.call('HSET', key, ARGV[1], encoded)
return {meeting, encoded}
";
