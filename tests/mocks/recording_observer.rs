use std::sync::Mutex;

use workbench_engine::{ExecutionEvent, ExecutionObserver};

/// Keeps every execution event, rendered to a compact string
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Events whose rendering starts with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events().into_iter().filter(|event| event.starts_with(prefix)).collect()
    }
}

impl ExecutionObserver for RecordingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        let rendered = match event {
            ExecutionEvent::ComponentCreated { component, stage } => format!("created:{}:{}", stage, component),
            ExecutionEvent::ComponentExecuting { component, stage, iteration, .. } => match iteration {
                Some(iteration) => format!("executing:{}:{}:{}", stage, component, iteration),
                None => format!("executing:{}:{}", stage, component),
            },
            ExecutionEvent::IterationBegin(iteration) => format!("iteration-begin:{}", iteration),
            ExecutionEvent::IterationEnd(iteration) => format!("iteration-end:{}", iteration),
            ExecutionEvent::ActionBegin { component, iteration } => format!("action-begin:{}:{}", component, iteration),
            ExecutionEvent::ActionEnd { component, iteration, status } => {
                format!("action-end:{}:{}:{}", component, iteration, status.as_str())
            }
        };

        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(rendered);
    }
}
