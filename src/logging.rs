// Replay-safe logging macros: emit only when the context is not replaying.

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(
                target: "durable_e2e::orchestration",
                instance_id = %$ctx.instance_id(),
                turn_idx = $ctx.turn_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(
                target: "durable_e2e::orchestration",
                instance_id = %$ctx.instance_id(),
                turn_idx = $ctx.turn_index(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(
                target: "durable_e2e::orchestration",
                instance_id = %$ctx.instance_id(),
                turn_idx = $ctx.turn_index(),
                $($arg)+
            );
        }
    }};
}
