#[derive(Debug)]
pub enum WorkerMessage {
    /// Terminate the job. `force` sends SIGKILL right away, otherwise SIGTERM first.
    Stop { force: bool },
}
