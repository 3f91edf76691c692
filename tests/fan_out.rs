mod common;

use tokio::sync::broadcast::error::TryRecvError;

use common::Harness;
use live_poll::broadcast::{poll_topic, PollEvent, GLOBAL_TOPIC};
use live_poll::PollError;

#[tokio::test]
async fn vote_events_reach_poll_and_global_topics() {
    let h = Harness::new().await;
    let ada = h.user("ada").await;
    let grace = h.user("grace").await;
    let poll = h.poll(ada, &["A", "B"]).await;
    let a = poll.option("A").unwrap().option_id;

    let mut topic = h.broadcaster.subscribe(&poll_topic(poll.id));
    let mut global = h.broadcaster.subscribe(GLOBAL_TOPIC);
    let outcome = h.service.cast_vote(grace, poll.id, a).await.unwrap();

    for (rx, name) in [
        (&mut topic, poll_topic(poll.id)),
        (&mut global, GLOBAL_TOPIC.to_string()),
    ] {
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, name);
        match &envelope.event {
            PollEvent::VoteCast { poll: snapshot, voter } => {
                assert_eq!(voter.id, grace);
                assert_eq!(voter.name, "grace");
                assert_eq!(snapshot, &outcome.poll);
                assert_eq!(snapshot.total_votes, 1);
            }
            other => panic!("expected vote_cast, got {}", other.kind()),
        }
    }

    h.service.retract_vote(grace, outcome.vote.id).await.unwrap();
    let envelope = global.recv().await.unwrap();
    assert!(matches!(&envelope.event, PollEvent::VoteRemoved { poll, .. } if poll.total_votes == 0));
}

#[tokio::test]
async fn failed_operations_publish_nothing() {
    let h = Harness::new().await;
    let ada = h.user("ada").await;
    let grace = h.user("grace").await;
    let poll = h.poll(ada, &["A", "B"]).await;
    let a = poll.option("A").unwrap().option_id;
    h.service.cast_vote(grace, poll.id, a).await.unwrap();

    let mut global = h.broadcaster.subscribe(GLOBAL_TOPIC);
    assert!(matches!(
        h.service.cast_vote(grace, poll.id, a).await,
        Err(PollError::DuplicateVote)
    ));
    assert!(matches!(
        h.service.delete_poll(poll.id, grace).await,
        Err(PollError::Authorization)
    ));

    assert!(matches!(global.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn other_polls_stay_quiet() {
    let h = Harness::new().await;
    let ada = h.user("ada").await;
    let grace = h.user("grace").await;
    let lunch = h.poll(ada, &["A", "B"]).await;
    let dinner = h.poll(ada, &["C", "D"]).await;

    let mut dinner_topic = h.broadcaster.subscribe(&poll_topic(dinner.id));
    let a = lunch.option("A").unwrap().option_id;
    h.service.cast_vote(grace, lunch.id, a).await.unwrap();

    assert!(matches!(dinner_topic.try_recv(), Err(TryRecvError::Empty)));
}
