// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::Shutdown;

/// Handler trait for processing tasks
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    /// Handle one task taken from the queue of worker `worker_id`
    fn handle(&self, worker_id: usize, task: T) -> impl Future<Output = ()> + Send;
}

/// Worker pool parameters
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// capacity of every channel
    pub channel_capacity: usize,
    /// number of channels, each one drained by exactly one worker
    pub num_channels: usize,
    pub monitor_interval: Duration,
    pub worker_check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 4,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

/// A worker pool with multiple independent task channels.
///
/// Every channel has its own dedicated worker, so tasks sent to the same channel are
/// handled one at a time and in the order they were sent. A worker that dies (usually
/// because the handler panicked) is respawned on the same channel by the monitor.
#[derive(Debug)]
pub struct MultipleChannelWorkerPool<T> {
    channels: Arc<Vec<TaskChannel<T>>>,
}

#[derive(Debug)]
struct TaskChannel<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> MultipleChannelWorkerPool<T> {
    /// Spawns the workers and their monitor; must be called inside a tokio runtime.
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: PoolConfig,
    ) -> Self {
        let channels = Self::spawn_channels_with_monitor(config, notify_shutdown, handler);

        Self { channels }
    }

    /// Send a task to the channel `channel_id`, waiting while that channel is full.
    ///
    /// Ids past the channel count wrap around.
    pub async fn send(
        &self,
        task: T,
        channel_id: usize,
    ) -> Result<(), async_channel::SendError<T>> {
        let channel = &self.channels[channel_id % self.channels.len()];
        channel.sender.send(task).await
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of tasks waiting in channel `channel_id`
    pub fn pending(&self, channel_id: usize) -> usize {
        self.channels[channel_id % self.channels.len()].sender.len()
    }

    fn spawn_channels_with_monitor<H: PoolHandler<T>>(
        config: PoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
    ) -> Arc<Vec<TaskChannel<T>>> {
        // zero sized pools are the caller's job to rule out, keep at least one channel
        let num_channels = config.num_channels.max(1);
        let mut workers = Vec::with_capacity(num_channels);
        let mut channels = Vec::with_capacity(num_channels);

        for id in 0..num_channels {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity.max(1));
            let worker = Self::spawn_worker(
                id,
                handler.clone(),
                notify_shutdown.clone(),
                receiver.clone(),
            );
            workers.push(worker);
            channels.push(TaskChannel { sender, receiver });
        }

        let channels = Arc::new(channels);

        Self::spawn_monitor(workers, channels.clone(), notify_shutdown, handler, config);

        channels
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        notify_shutdown: broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);

        let handle = tokio::spawn(async move {
            debug!("Worker {id} started");

            loop {
                tokio::select! {
                    Ok(task) = receiver.recv() => {
                        handler.handle(id, task).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        channels: Arc<Vec<TaskChannel<T>>>,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: PoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            let mut shutdown = Shutdown::subscribe(&notify_shutdown);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(config.worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            // workers only return after seeing the shutdown signal
                                            debug!("Worker {} exited, monitor stops", worker.id);
                                            return;
                                        }
                                        Err(err) => {
                                            if err.is_panic() {
                                                Self::log_worker_panic(worker.id, err);
                                            } else {
                                                error!("Worker {} failed with non-panic error", worker.id);
                                            }
                                        }
                                    }

                                    warn!("Worker {} failed, restarting...", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        notify_shutdown.clone(),
                                        channels[worker.id].receiver.clone(),
                                    );
                                    debug!("Worker {} restarted", worker.id);
                                }
                                Err(_) => {
                                    trace!("Worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("Worker monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("Worker {worker_id} panicked with message: {message}");
        } else {
            error!(
                "Worker {worker_id} panicked with an unknown type: {}",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
