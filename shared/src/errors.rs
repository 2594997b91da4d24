use std::fmt::Display;

pub trait ResultExt<T, E>
where
    E: Display,
{
    /// Exits the process if the result is `Err`, otherwise unwraps `Ok`.
    ///
    /// Desirable for setup errors (DB connection, queue declaration) that
    /// should terminate the entire program rather than just panic on the
    /// current task.
    fn unwrap_or_exit_process(self) -> T;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Display,
{
    fn unwrap_or_exit_process(self) -> T {
        match self {
            Ok(t) => t,
            Err(err) => {
                tracing::error!("fatal error, exiting: {}", err);
                std::process::exit(1)
            }
        }
    }
}
