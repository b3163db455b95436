//! Ordered application of flow controllers around request processing
//!
//! [`FlowChain::admit`] runs every controller in order and hands back an
//! [`Admission`]. The request is processed while the admission is alive;
//! dropping it releases every controller that admitted, last first. This also
//! happens when the handler fails, panics, or its future is dropped.

use crate::controller::{ControllerStatus, FlowController};
use crate::{FlowError, Request};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default overall admission timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// The controller list currently in force
///
/// # Example
///
/// ```
/// use flowgate::{FlowChain, FlowController, GlobalFlowController, Request};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let global: Arc<dyn FlowController> = Arc::new(GlobalFlowController::new(1));
/// let chain = FlowChain::new(vec![global.clone()], Duration::from_secs(5));
///
/// let request = Arc::new(Request::builder().service("WMS").build());
/// let admission = chain.admit(request).await.unwrap();
/// assert_eq!(global.status().running, 1);
///
/// drop(admission);
/// assert_eq!(global.status().running, 0);
/// # });
/// ```
pub struct FlowChain {
    snapshot: RwLock<Arc<Snapshot>>,
}

struct Snapshot {
    controllers: Vec<Arc<dyn FlowController>>,
    timeout: Duration,
}

impl FlowChain {
    pub fn new(controllers: Vec<Arc<dyn FlowController>>, timeout: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                controllers,
                timeout,
            })),
        }
    }

    /// Replace the controllers and timeout
    ///
    /// Admissions already under way keep the controllers they started with,
    /// and release them on completion.
    pub fn reload(&self, controllers: Vec<Arc<dyn FlowController>>, timeout: Duration) {
        tracing::info!(
            "Flow control reloaded: {} controllers, {:?} timeout",
            controllers.len(),
            timeout
        );
        *self.snapshot.write() = Arc::new(Snapshot {
            controllers,
            timeout,
        });
    }

    pub fn timeout(&self) -> Duration {
        self.snapshot.read().timeout
    }

    pub fn controllers(&self) -> Vec<Arc<dyn FlowController>> {
        self.snapshot.read().controllers.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every controller admits the request
    ///
    /// Each controller gets whatever is left of the overall timeout. A
    /// controller running out of time fails the call with
    /// [`FlowError::Timeout`]; a rate rejection is passed through. On failure
    /// (or if this future is dropped) the controllers that already admitted
    /// are released.
    pub async fn admit(&self, request: Arc<Request>) -> Result<Admission, FlowError> {
        let snapshot = self.snapshot.read().clone();
        let deadline = Instant::now().checked_add(snapshot.timeout);

        let mut admission = Admission {
            request: request.clone(),
            admitted: Vec::with_capacity(snapshot.controllers.len()),
        };
        for controller in &snapshot.controllers {
            let left = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => snapshot.timeout,
            };
            if !controller.request_incoming(&request, left).await? {
                let name = controller.name();
                tracing::debug!("Request timed out waiting for {}", name);
                return Err(FlowError::Timeout { controller: name });
            }
            admission.admitted.push(controller.clone());
        }

        tracing::trace!("Request admitted by {} controllers", admission.admitted.len());
        Ok(admission)
    }

    /// Occupancy of every controller, in chain order
    pub fn statuses(&self) -> Vec<ControllerStatus> {
        self.snapshot
            .read()
            .controllers
            .iter()
            .map(|c| c.status())
            .collect()
    }
}

impl Default for FlowChain {
    /// A chain admitting everything
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_TIMEOUT)
    }
}

/// Proof of admission; releases the controllers when dropped
#[must_use = "dropping the admission releases the request immediately"]
pub struct Admission {
    request: Arc<Request>,
    admitted: Vec<Arc<dyn FlowController>>,
}

impl Admission {
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Number of controllers holding something for this request
    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        for controller in self.admitted.iter().rev() {
            controller.request_complete(&self.request);
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.admitted.iter().map(|c| c.name()).collect();
        f.debug_struct("Admission")
            .field("controllers", &names)
            .finish()
    }
}
