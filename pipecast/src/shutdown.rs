//! Cooperative cancellation.
//!
//! A [`Shutdown`] owns the trigger; every suspendable task gets a cloned
//! [`ShutdownSignal`]. Child shutdowns fire when either they or any ancestor
//! fires, which lets the lifecycle monitor stop one pacer without stopping
//! the process. Dropping a `Shutdown` counts as firing it.

use futures_util::future::select_all;
use tokio::sync::watch;

pub struct Shutdown {
    tx: watch::Sender<bool>,
    ancestors: Vec<watch::Receiver<bool>>,
}

#[derive(Clone)]
pub struct ShutdownSignal {
    chain: Vec<watch::Receiver<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            ancestors: Vec::new(),
        }
    }

    pub fn child_of(parent: &ShutdownSignal) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            ancestors: parent.chain.clone(),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        let mut chain = Vec::with_capacity(self.ancestors.len() + 1);
        chain.push(self.tx.subscribe());
        chain.extend(self.ancestors.iter().cloned());
        ShutdownSignal { chain }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.chain
            .iter()
            .any(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Resolves once this signal or any ancestor fires.
    pub async fn triggered(&mut self) {
        let waits = self.chain.iter_mut().map(|rx| {
            Box::pin(async move {
                let _ = rx.wait_for(|fired| *fired).await;
            })
        });
        select_all(waits).await;
    }
}
