pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# KANDI CONFIGURATION
# =============================================================================
# Kandi drains line-protocol records from Kafka, batches them and writes them
# to InfluxDB. Offsets are committed only after InfluxDB accepted the batch.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. $KANDI_CONFIG
#   3. ~/.config/kandi/config.yml
#   4. /etc/kandi/config.yml
#
# Any value may reference an environment variable as $env{...}; unset
# variables are reported when the file is loaded.
# Durations take integer milliseconds or strings such as 250ms, 5s, 1m.

kandi:
  # trace, debug, info, warn or error (RUST_LOG overrides this)
  log_level: info

  # Completed batches allowed to wait for the InfluxDB writer
  queue_capacity: 4

  batch:
    # A batch closes after this many records...
    size: 1000
    # ...or after this much time, whichever comes first (0 = no time limit)
    duration: 5s

  backoff:
    # First wait after a failure; doubles on every consecutive failure.
    # Use 'disabled' (or a negative value) to retry without waiting.
    interval: 100ms
    # Upper bound for the wait (0 = unbounded)
    max: 30s
    # A quiet period this long resets the wait to 'interval' (0 = never)
    reset: 5m

  backfill:
    # 'kandi backfill' stops once no records arrived for this long (0 = never)
    idle_timeout: 30s

kafka:
  brokers:
    - localhost:9092
  topics:
    - metrics
  consumer_group: kandi
  # Defaults to kandi-<hostname>-<uuid>
  # client_id: kandi-1
  # Where a new consumer group starts: oldest or newest
  offsets_initial: oldest
  poll_timeout: 100ms
  commit_interval: 1s
  session_timeout: 10s
  logging_enabled: false
  # Extra librdkafka settings, applied last
  properties: {}

influx:
  url: http://localhost:8086
  database: metrics
  user: ""
  password: ""
  timeout: 5s
  user_agent: kandi
  # ns, u, ms, s, m or h (empty = server default)
  precision: ns
  retention_policy: ""
  write_consistency: ""
  # Errors containing these strings still count as a completed write
  accepted_errors:
    - partial write
    - field type conflict

metrics:
  enabled: true
  listen: 127.0.0.1:8089
"#
    .to_string()
}
