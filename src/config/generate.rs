pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# UDPSHIPPER CONFIGURATION
# =============================================================================
# udpshipper tails files matching glob patterns and forwards every complete
# line as one UDP datagram to a collector. Delivery is best effort: the
# transport may lose datagrams, but offsets are tracked so that a restart
# never skips lines and re-sends at most the tail that was not yet flushed.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/udpshipper/config.yml
#   3. /etc/udpshipper/config.yml
#
# Any value may reference environment variables with $env{NAME}.

# =============================================================================
# INPUTS
# =============================================================================

inputs:
  # Glob patterns of files to harvest (at least one)
  paths:
    - /var/log/app/*.log
  # Glob patterns removed from the matched set
  exclude:
    - /var/log/app/*_debug.log
  # How often the glob patterns are re-expanded
  scan_interval: 10s
  # How long a harvester sleeps at end of file before checking for new data
  eof_poll_interval: 250ms
  # Start files seen for the first time at their end instead of offset 0
  tail_from_end: false
  # Longest line (in bytes) a single event may carry
  max_line_bytes: 1048576
  # What to do with longer lines: 'split', 'truncate' or 'drop'
  on_long_line: split

# =============================================================================
# REGISTRY
# =============================================================================
# Durable record of the byte offset shipped for every file.

registry:
  path: /var/lib/udpshipper/registry.json
  flush_interval: 5s
  # Forget files that have not matched any pattern for this long
  clean_inactive: 72h

# =============================================================================
# SPOOLER
# =============================================================================
# Bounded in-memory queue between harvesters and the network publisher.
# Harvesters block when it is full.

spooler:
  capacity: 4096
  batch_size: 256
  batch_timeout: 100ms

# =============================================================================
# OUTPUT
# =============================================================================

output:
  host: 127.0.0.1
  port: 5000
  # 'json' sends a JSON document per datagram, 'udplogbeat' prefixes it with
  # 'json:<log_type>:' for udplogbeat collectors
  format: json
  log_type: log
  # Largest datagram payload; bigger events are handled per on_oversize
  max_datagram_bytes: 1024
  # 'truncate' shortens the message, 'split' sends numbered fragments
  on_oversize: truncate
  retry:
    max_retries: 3
    initial_backoff: 50ms
    max_backoff: 2s

# =============================================================================
# SHUTDOWN
# =============================================================================

shutdown:
  # Time allowed for queued events to be published before forcing exit
  grace_period: 5s
  # Optional file that exists while the agent is running
  # running_marker: /run/udpshipper.running
"#
    .to_string()
}
