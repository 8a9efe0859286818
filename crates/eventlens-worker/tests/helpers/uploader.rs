use async_trait::async_trait;
use eventlens_core::models::FileRef;
use eventlens_core::UploadFailure;
use eventlens_storage::{FileUploader, ProgressSender};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Uploader whose results are scripted per file name.
///
/// Each call pops the next scripted failure for the file; once the script is
/// empty the upload succeeds, unless `always_fail` is set.
#[derive(Default)]
pub struct ScriptedUploader {
    scripts: Mutex<HashMap<String, VecDeque<UploadFailure>>>,
    calls: Mutex<HashMap<String, usize>>,
    always_fail: Option<UploadFailure>,
}

impl ScriptedUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(failure: UploadFailure) -> Self {
        Self {
            always_fail: Some(failure),
            ..Self::default()
        }
    }

    /// Fail the next uploads of `file_name` with `failures`, in order.
    pub fn fail(self, file_name: &str, failures: Vec<UploadFailure>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(file_name.to_string(), failures.into());
        self
    }

    pub fn calls(&self, file_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(file_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl FileUploader for ScriptedUploader {
    async fn upload(
        &self,
        file_ref: &FileRef,
        destination: &str,
        progress: &ProgressSender,
    ) -> Result<String, UploadFailure> {
        let name = file_ref.file_name().to_string();
        *self.calls.lock().unwrap().entry(name.clone()).or_default() += 1;
        tokio::task::yield_now().await;

        if let Some(failure) = self.always_fail.clone() {
            return Err(failure);
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&name)
            .and_then(|script| script.pop_front());
        if let Some(failure) = scripted {
            return Err(failure);
        }

        progress.send_replace(100);
        Ok(format!("mem://{}/{}", destination, name))
    }
}
