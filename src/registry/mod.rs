use std::fmt;
use std::sync::Arc;

use crate::job::Job;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler callback invoked on a worker pool thread with the fetched job.
pub type Handler = Arc<dyn Fn(&Job) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Clone)]
pub struct Task {
    pub job_type: String,
    pub handler: Handler,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("job_type", &self.job_type)
            .field("handler", &"<dyn Fn>")
            .finish()
    }
}

/// Job-type to handler mapping. Duplicate registrations for one job type are
/// allowed and fan out: every matching task is dispatched for a fetched job.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Handler) {
        self.tasks.push(Task {
            job_type: job_type.into(),
            handler,
        });
    }

    /// Removes every task registered for the job type.
    pub fn deregister(&mut self, job_type: &str) {
        self.tasks.retain(|task| task.job_type != job_type);
    }

    /// All tasks matching the job's type, in registration order.
    pub fn resolve(&self, job: &Job) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|task| task.job_type == job.jobtype)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::job::Job;

    use super::{Handler, TaskRegistry};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn resolve_returns_matching_tasks_in_registration_order() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut registry = TaskRegistry::new();
        registry.register("Email", counting_handler(Arc::clone(&first)));
        registry.register("Report", counting_handler(Arc::new(AtomicUsize::new(0))));
        registry.register("Email", counting_handler(Arc::clone(&second)));

        let job = Job::new("1", "Email");
        let resolved = registry.resolve(&job);
        assert_eq!(resolved.len(), 2);

        (resolved[0].handler)(&job).expect("handler should pass");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resolve_is_empty_for_unregistered_type() {
        let mut registry = TaskRegistry::new();
        registry.register("Email", counting_handler(Arc::new(AtomicUsize::new(0))));

        assert!(registry.resolve(&Job::new("1", "Unknown")).is_empty());
    }

    #[test]
    fn deregister_removes_every_matching_task() {
        let mut registry = TaskRegistry::new();
        registry.register("Email", counting_handler(Arc::new(AtomicUsize::new(0))));
        registry.register("Email", counting_handler(Arc::new(AtomicUsize::new(0))));
        registry.register("Report", counting_handler(Arc::new(AtomicUsize::new(0))));

        registry.deregister("Email");

        assert!(registry.resolve(&Job::new("1", "Email")).is_empty());
        assert_eq!(registry.resolve(&Job::new("2", "Report")).len(), 1);
        assert!(!registry.is_empty());
    }
}
