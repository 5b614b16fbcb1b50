#![cfg(all(test, loom))]

use crate::queue::ArrayQueue;
use alloc::vec::Vec;
use loom::sync::Arc;
use loom::thread;

#[test]
fn queue_two_producers_one_consumer() {
    loom::model(|| {
        let queue: Arc<ArrayQueue<u32>> = Arc::new(ArrayQueue::new(4));

        let mut producers = Vec::new();
        for p in 0..2u32 {
            let queue = queue.clone();
            producers.push(thread::spawn(move || {
                let mut pushed = 0;
                if queue.try_push(p).is_ok() {
                    pushed += 1;
                }
                pushed
            }));
        }

        let consumer_queue = queue.clone();
        let consumer = thread::spawn(move || {
            let mut popped = 0;
            for _ in 0..2 {
                if consumer_queue.try_pop().is_some() {
                    popped += 1;
                }
            }
            popped
        });

        let pushed: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();
        let popped = consumer.join().unwrap();

        // Whatever was not consumed during the race must still be there.
        let mut remaining = 0;
        while queue.try_pop().is_some() {
            remaining += 1;
        }
        assert_eq!(popped + remaining, pushed);
    });
}

#[test]
fn queue_full_rejection_is_exact() {
    loom::model(|| {
        let queue: Arc<ArrayQueue<u32>> = Arc::new(ArrayQueue::new(2));

        let producer_queue = queue.clone();
        let producer = thread::spawn(move || {
            let mut accepted = 0;
            for i in 0..3 {
                if producer_queue.try_push(i).is_ok() {
                    accepted += 1;
                }
            }
            accepted
        });

        let accepted = producer.join().unwrap();
        assert_eq!(accepted, 2, "capacity-2 queue accepts exactly 2");

        let mut drained = 0;
        while queue.try_pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 2);
    });
}
