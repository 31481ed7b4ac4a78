use tokio::sync::{mpsc, oneshot, watch};
use tracing::{trace, warn};

const MAX_BATCHED_COMMANDS: usize = 64;

type Mutation<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Command<S> {
    Apply(Mutation<S>),
    Barrier(oneshot::Sender<()>),
}

/// Single-writer owner of a state value.
///
/// Mutations are queued on an unbounded channel and applied by one task in
/// the order they were submitted. Submitting never waits on the apply.
/// Readers get the last applied value from a watch channel without going
/// through the queue, so `S` should be cheap to clone (an `im` collection or
/// a struct of them).
pub struct SerialActor<S> {
    name: &'static str,
    command_tx: mpsc::UnboundedSender<Command<S>>,
    state_rx: watch::Receiver<S>,
}

impl<S> Clone for SerialActor<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            command_tx: self.command_tx.clone(),
            state_rx: self.state_rx.clone(),
        }
    }
}

impl<S> SerialActor<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Spawns the owning task on the current tokio runtime. The task stops
    /// once every handle has been dropped.
    pub fn spawn(name: &'static str, initial: S) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(initial);
        tokio::spawn(run(name, command_rx, state_tx));
        Self {
            name,
            command_tx,
            state_rx,
        }
    }

    /// Queues a mutation.
    pub fn send<F>(&self, mutation: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self
            .command_tx
            .send(Command::Apply(Box::new(mutation)))
            .is_err()
        {
            warn!(actor = self.name, "actor stopped, dropping mutation");
        }
    }

    /// Resolves once every mutation queued before this call has been applied.
    pub async fn await_applied(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(Command::Barrier(done_tx)).is_err() {
            warn!(actor = self.name, "actor stopped, nothing to wait for");
            return;
        }
        let _ = done_rx.await;
    }

    /// Last applied state.
    pub fn snapshot(&self) -> S {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.state_rx.clone()
    }
}

async fn run<S>(
    name: &'static str,
    mut command_rx: mpsc::UnboundedReceiver<Command<S>>,
    state_tx: watch::Sender<S>,
) {
    let mut commands = Vec::with_capacity(MAX_BATCHED_COMMANDS);
    loop {
        // zero means the channel is closed and drained
        let received = command_rx
            .recv_many(&mut commands, MAX_BATCHED_COMMANDS)
            .await;
        if received == 0 {
            break;
        }
        let mut barriers = Vec::new();
        state_tx.send_modify(|state| {
            for command in commands.drain(..) {
                match command {
                    Command::Apply(mutation) => mutation(state),
                    Command::Barrier(done) => barriers.push(done),
                }
            }
        });
        for done in barriers {
            let _ = done.send(());
        }
    }
    trace!(actor = name, "all handles dropped, stopping actor");
}

#[cfg(test)]
mod tests {
    use im::HashMap;

    use super::*;

    #[tokio::test]
    async fn test_mutations_apply_in_submission_order() {
        let actor = SerialActor::spawn("test", Vec::<u32>::new());
        for i in 0..500 {
            actor.send(move |v| v.push(i));
        }
        actor.await_applied().await;

        let applied = actor.snapshot();
        assert_eq!(applied, (0..500).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_snapshot_is_frozen() {
        let actor = SerialActor::spawn("test", HashMap::<String, u32>::new());
        actor.send(|m| {
            m.insert("a".to_string(), 1);
        });
        actor.await_applied().await;
        let before = actor.snapshot();

        actor.send(|m| {
            m.insert("b".to_string(), 2);
        });
        actor.await_applied().await;

        assert_eq!(before.len(), 1);
        assert_eq!(actor.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_the_same_queue() {
        let actor = SerialActor::spawn("test", 0u64);
        let other = actor.clone();
        actor.send(|n| *n += 1);
        other.send(|n| *n *= 10);
        other.await_applied().await;

        assert_eq!(actor.snapshot(), 10);
    }
}
