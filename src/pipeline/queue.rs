use super::clipboard::Clipboard;
use std::collections::VecDeque;

/// FIFO of clipboards sitting between two adjacent stages
///
/// An empty queue is "no data yet", never an error: `get_next_dataset` and
/// `element` simply return `None`.
#[derive(Debug, Default)]
pub struct Queue {
    datasets: VecDeque<Clipboard>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a clipboard to the tail
    pub fn add_dataset(&mut self, clipboard: Clipboard) {
        self.datasets.push_back(clipboard);
    }

    /// Remove and return the head clipboard
    pub fn get_next_dataset(&mut self) -> Option<Clipboard> {
        self.datasets.pop_front()
    }

    /// Peek at the head clipboard without consuming it
    pub fn element(&self) -> Option<&Clipboard> {
        self.datasets.front()
    }

    /// Mutable peek at the head clipboard
    pub fn element_mut(&mut self) -> Option<&mut Clipboard> {
        self.datasets.front_mut()
    }

    pub fn size(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// The `n_stages + 1` queues linking a stage sequence
///
/// Stage ids are 1-based: stage `i` reads from queue `i - 1` and writes to queue `i`.
#[derive(Debug)]
pub struct QueueChain {
    queues: Vec<Queue>,
}

impl QueueChain {
    pub fn new(n_stages: usize) -> Self {
        Self {
            queues: (0..=n_stages).map(|_| Queue::new()).collect(),
        }
    }

    /// Number of stages the chain links
    pub fn stage_count(&self) -> usize {
        self.queues.len() - 1
    }

    /// Number of queues (always `stage_count() + 1`)
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Queue::is_empty)
    }

    /// Seed queue 0 with a fresh clipboard to begin a visit
    pub fn seed(&mut self) {
        self.queues[0].add_dataset(Clipboard::new());
    }

    pub fn queue(&self, index: usize) -> &Queue {
        &self.queues[index]
    }

    /// Input queue of stage `stage_id`
    pub fn input(&mut self, stage_id: usize) -> &mut Queue {
        &mut self.queues[stage_id - 1]
    }

    /// Output queue of stage `stage_id`
    pub fn output(&mut self, stage_id: usize) -> &mut Queue {
        &mut self.queues[stage_id]
    }

    /// Move the head clipboard of the stage's input unmodified to its output
    ///
    /// Returns whether a clipboard was moved.
    pub fn transfer(&mut self, stage_id: usize) -> bool {
        match self.input(stage_id).get_next_dataset() {
            Some(clipboard) => {
                self.output(stage_id).add_dataset(clipboard);
                true
            }
            None => false,
        }
    }

    /// Push an empty clipboard to the stage's output
    pub fn post_empty(&mut self, stage_id: usize) {
        self.output(stage_id).add_dataset(Clipboard::new());
    }

    /// Remove the clipboard that completed the visit
    pub fn drain_final(&mut self) -> Option<Clipboard> {
        let last = self.queues.len() - 1;
        self.queues[last].get_next_dataset()
    }
}
