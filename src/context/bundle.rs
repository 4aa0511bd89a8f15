/// The compressed payload handed to one execution attempt. Never persisted;
/// it lives exactly as long as the attempt it was built for.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub task_id: String,
    payload: String,
}

impl ContextBundle {
    pub(crate) fn new(task_id: impl Into<String>, payload: String) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Encoded byte length, the quantity the budget invariant is stated over.
    pub fn byte_len(&self) -> usize {
        self.payload.len()
    }
}
