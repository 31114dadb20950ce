use bytes::Bytes;
use serde::Serialize;

use super::serialisable::BeanstalkSerialisable;
use super::states::JobState;

/// One parsed command line. `put` is the only command followed by a data
/// block; the session reads that separately.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// `put <pri> <delay> <ttr> <bytes>`, into the tube the connection uses.
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// `reserve`. Waits for as long as it takes.
    Reserve,
    /// `reserve-with-timeout <seconds>`. Zero polls once.
    ReserveWithTimeout { timeout: u32 },
    /// `reserve-job <id>`. Reserves a particular job unless another
    /// connection already holds it.
    ReserveJob { id: u64 },
    /// `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// `delete <id>`. Reserved jobs may only be deleted by their holder.
    Delete { id: u64 },
    /// `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// `touch <id>`. Restarts the TTR countdown of a job we hold.
    Touch { id: u64 },
    /// `watch <tube>`
    Watch { tube: String },
    /// `ignore <tube>`. Refused when it would empty the watch list.
    Ignore { tube: String },
    /// `peek <id>`, whatever state the job is in.
    Peek { id: u64 },
    /// `peek-ready`: the job the next reserve on the used tube would get.
    PeekReady,
    /// `peek-delayed`: the delayed job on the used tube that wakes first.
    PeekDelayed,
    /// `peek-buried`: the oldest burial on the used tube.
    PeekBuried,
    /// `kick <bound>`. Kicks buried jobs if the used tube has any, and only
    /// otherwise delayed ones, so draining both takes two kicks.
    Kick { bound: u64 },
    /// `kick-job <id>`, for a single buried or delayed job.
    KickJob { id: u64 },
    /// `stats-job <id>`
    StatsJob { id: u64 },
    /// `stats-tube <tube>`
    StatsTube { tube: String },
    /// `stats`
    StatsServer,
    /// `list-tubes`
    ListTubes,
    /// `list-tube-used`
    ListTubeUsed,
    /// `list-tubes-watched`
    ListTubesWatched,
    /// `quit`. Closes the connection, releasing whatever it holds.
    Quit,
    /// `pause-tube <tube> <seconds>`. Zero lifts an existing pause.
    PauseTube { tube: String, delay: u32 },
    /// `use <tube>`
    Use { tube: String },
}

/// Every reply the server sends. Variants carrying data are followed by a
/// length-prefixed block on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum BeanstalkResponse {
    /// `INTERNAL_ERROR`: the server got itself into a state it cannot explain.
    InternalError,
    /// `BAD_FORMAT`: an argument was missing, malformed or out of range, a
    /// tube name was invalid, or the line was too long.
    BadFormat,
    /// `UNKNOWN_COMMAND`
    UnknownCommand,
    /// `INSERTED <id>`
    Inserted { id: u64 },
    /// `EXPECTED_CRLF`: a put body was not followed by CRLF.
    ExpectedCRLF,
    /// `JOB_TOO_BIG`: a put body exceeds the configured maximum.
    JobTooBig,
    /// `USING <tube>`, after `use` and `list-tube-used`.
    Using { tube: String },
    /// `DEADLINE_SOON`: nothing is ready and a job this connection holds is
    /// within a second of its TTR.
    DeadlineSoon,
    /// `TIMED_OUT`: a reserve timeout passed with nothing to hand out.
    TimedOut,
    /// `RESERVED <id> <bytes>` with the job body.
    Reserved { id: u64, data: Bytes },
    /// `NOT_FOUND`: the job or tube does not exist, or is not in a state the
    /// command accepts. Commands on held jobs also get this when another
    /// connection holds the job.
    NotFound,
    /// `DELETED`
    Deleted,
    /// `RELEASED`
    Released,
    /// `BURIED`
    Buried,
    /// `TOUCHED`
    Touched,
    /// `WATCHING <count>`, after `watch` and `ignore`.
    Watching { count: usize },
    /// `NOT_IGNORED`: ignoring would leave nothing watched.
    NotIgnored,
    /// `FOUND <id> <bytes>` with the job body, for the `peek` family.
    Found { id: u64, data: Bytes },
    /// `KICKED <count>`, after `kick`.
    KickedCount { count: u64 },
    /// `KICKED`, after `kick-job`.
    Kicked,
    /// `OK <bytes>` with a YAML mapping, after `stats-job`.
    OkStatsJob { data: JobStats },
    /// `OK <bytes>` with a YAML mapping, after `stats`.
    OkStats { data: ServerStats },
    /// `OK <bytes>` with a YAML mapping, after `stats-tube`.
    OkStatsTube { data: TubeStats },
    /// `OK <bytes>` with a YAML sequence, after `list-tubes` and
    /// `list-tubes-watched`.
    OkListTubes { tubes: Vec<String> },
    /// `PAUSED`
    Paused,
}

impl BeanstalkSerialisable for BeanstalkResponse {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkResponse::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            ExpectedCRLF => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            DeadlineSoon => b"DEADLINE_SOON\r\n".to_vec(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            Reserved { id, data } => with_body(format!("RESERVED {id}"), data),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Found { id, data } => with_body(format!("FOUND {id}"), data),
            KickedCount { count } => format!("KICKED {count}\r\n").into(),
            Kicked => b"KICKED\r\n".to_vec(),
            OkStatsJob { data } => yaml_ok(data),
            OkStats { data } => yaml_ok(data),
            OkListTubes { tubes } => yaml_ok(tubes),
            Paused => b"PAUSED\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
            OkStatsTube { data } => yaml_ok(data),
        }
    }
}

/// Encodes `<prefix> <n_bytes>\r\n<data>\r\n`.
fn with_body(prefix: String, data: &[u8]) -> Vec<u8> {
    [
        format!("{prefix} {}\r\n", data.len()).into_bytes(),
        data.to_vec(),
        b"\r\n".to_vec(),
    ]
    .concat()
}

/// Encodes `OK <n_bytes>\r\n<yaml>\r\n`.
fn yaml_ok<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => {
            let data = format!("---\n{data}");
            format!("OK {}\r\n{data}\r\n", data.len()).into()
        },
        Err(_) => BeanstalkResponse::InternalError.serialise_beanstalk(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: u64,
    /// tube containing job
    pub tube: String,
    /// job state
    pub state: JobState,
    /// priority set by last put/release/bury
    pub pri: u32,

    /// time in seconds since creation
    pub age: u64,
    /// seconds the job was delayed by its last put/release
    pub delay: u64,
    /// allowed processing time in seconds
    pub ttr: u64,
    /// time until job returns to ready queue
    #[serde(rename = "time-left")]
    pub time_left: u64,

    /// binlog file holding the job's full record
    pub file: u64,

    /// number of times job reserved
    pub reserves: u64,
    /// number of times job timed out
    pub timeouts: u64,
    /// number of times job released
    pub releases: u64,
    /// number of times job buried
    pub buries: u64,
    /// number of times job kicked
    pub kicks: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TubeStats {
    /// tube name
    pub name: String,
    /// number of jobs in ready state with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of clients that have `use`d this queue
    #[serde(rename = "current-using")]
    pub current_using: u64,
    /// number of clients that have `watch`ed this queue and are waiting on a
    /// `reserve`
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// number of clients that have `watch`ed this queue
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    /// number of seconds this queue was last paused for
    pub pause: u64,
    /// number of `delete` commands issued for this tube
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of `pause-tube` commands issued for this tube
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
    /// seconds remaining until the queue is un-paused.
    #[serde(rename = "pause-time-left")]
    pub pause_time_left: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServerStats {
    /// number of ready jobs with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in the ready queue
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by all clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of delayed jobs
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of buried jobs
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,

    #[serde(flatten)]
    pub commands: CommandCounts,

    /// cumulative count of times a job has timed out
    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    /// cumulative count of jobs created
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// maximum number of bytes in a job
    #[serde(rename = "max-job-size")]
    pub max_job_size: u64,
    /// number of currently-existing tubes
    #[serde(rename = "current-tubes")]
    pub current_tubes: u64,
    /// number of currently open connections
    #[serde(rename = "current-connections")]
    pub current_connections: u64,
    /// number of open connections that have each issued at least one put
    /// command
    #[serde(rename = "current-producers")]
    pub current_producers: u64,
    /// number of open connections that have each issued at least one reserve
    /// command
    #[serde(rename = "current-workers")]
    pub current_workers: u64,
    /// number of open connections that have issued a reserve command but not
    /// yet received a response
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// cumulative count of connections
    #[serde(rename = "total-connections")]
    pub total_connections: u64,
    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: &'static str,
    /// number of seconds since this server process started running
    pub uptime: u64,

    /// index of the oldest binlog file needed to store the current jobs
    #[serde(rename = "binlog-oldest-index")]
    pub binlog_oldest_index: u64,
    /// index of the current binlog file being written to. If binlog is not
    /// active this value will be 0
    #[serde(rename = "binlog-current-index")]
    pub binlog_current_index: u64,
    /// maximum size in bytes a binlog file is allowed to get before a new
    /// binlog file is opened
    #[serde(rename = "binlog-max-size")]
    pub binlog_max_size: u64,
    /// cumulative number of records written to the binlog
    #[serde(rename = "binlog-records-written")]
    pub binlog_records_written: u64,
    /// cumulative number of records written as part of compaction
    #[serde(rename = "binlog-records-migrated")]
    pub binlog_records_migrated: u64,

    /// random id string for this server process, generated every time the
    /// process starts
    pub id: String,
}

/// Number of each command received since startup.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CommandCounts {
    #[serde(rename = "cmd-put")]
    pub put: u64,
    #[serde(rename = "cmd-peek")]
    pub peek: u64,
    #[serde(rename = "cmd-peek-ready")]
    pub peek_ready: u64,
    #[serde(rename = "cmd-peek-delayed")]
    pub peek_delayed: u64,
    #[serde(rename = "cmd-peek-buried")]
    pub peek_buried: u64,
    #[serde(rename = "cmd-reserve")]
    pub reserve: u64,
    #[serde(rename = "cmd-reserve-with-timeout")]
    pub reserve_with_timeout: u64,
    #[serde(rename = "cmd-touch")]
    pub touch: u64,
    #[serde(rename = "cmd-use")]
    pub use_tube: u64,
    #[serde(rename = "cmd-watch")]
    pub watch: u64,
    #[serde(rename = "cmd-ignore")]
    pub ignore: u64,
    #[serde(rename = "cmd-delete")]
    pub delete: u64,
    #[serde(rename = "cmd-release")]
    pub release: u64,
    #[serde(rename = "cmd-bury")]
    pub bury: u64,
    #[serde(rename = "cmd-kick")]
    pub kick: u64,
    #[serde(rename = "cmd-stats")]
    pub stats: u64,
    #[serde(rename = "cmd-stats-job")]
    pub stats_job: u64,
    #[serde(rename = "cmd-stats-tube")]
    pub stats_tube: u64,
    #[serde(rename = "cmd-list-tubes")]
    pub list_tubes: u64,
    #[serde(rename = "cmd-list-tube-used")]
    pub list_tube_used: u64,
    #[serde(rename = "cmd-list-tubes-watched")]
    pub list_tubes_watched: u64,
    #[serde(rename = "cmd-pause-tube")]
    pub pause_tube: u64,
}
