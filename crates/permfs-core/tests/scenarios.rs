// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios: ownership, SetUID programs and elevation lifetime

use permfs_core::testing::{unix_fs, RecordingSink, GROUP, PASSWD};
use permfs_core::{
    Caller, ElevationKind, ElevationOutcome, EventType, FilesystemEvent, FsConfig, FsError,
    Identity, InvalidKind, Mode, UserDatabase, VirtualFileSystem,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn user(name: &str) -> Caller {
    let users = UserDatabase::from_etc(PASSWD, GROUP).unwrap();
    let identity = users.identity_for_name(name).unwrap();
    Caller::new(identity).in_dir(format!("/home/{}", name))
}

fn root() -> Caller {
    Caller::new(Identity::root())
}

fn vfs() -> VirtualFileSystem {
    unix_fs(FsConfig::default()).unwrap()
}

#[tokio::test]
async fn test_private_file_is_hidden_from_other_users() {
    let vfs = vfs();
    let alice = user("alice");
    let bob = user("bob");

    vfs.write_file(&alice, "/home/alice/notes.txt", b"hello").await.unwrap();
    vfs.chmod(&alice, "notes.txt", Mode::from_octal("0640").unwrap()).await.unwrap();

    let err = vfs.read_file(&bob, "/home/alice/notes.txt").await.unwrap_err();
    assert!(matches!(err, FsError::UnauthorizedAccess { .. }), "unexpected error: {err}");
    assert_eq!(err.errno(), libc::EACCES);

    assert_eq!(vfs.read_file(&alice, "notes.txt").await.unwrap(), b"hello");
    assert_eq!(vfs.read_file(&root(), "/home/alice/notes.txt").await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_sudo_runs_action_as_root() {
    let vfs = vfs();
    let alice = user("alice");

    let shadow = vfs
        .execute_as_owner(&alice, "/usr/bin/sudo", |elevated| {
            let vfs = &vfs;
            async move {
                assert_eq!(elevated.identity().uid, 0);
                assert_eq!(elevated.cwd(), "/home/alice");
                vfs.read_file(&elevated, "/etc/shadow").await
            }
        })
        .await
        .unwrap();
    assert!(shadow.starts_with(b"root:"));

    // The elevated identity never leaks back into the caller
    let err = vfs.read_file(&alice, "/etc/shadow").await.unwrap_err();
    assert!(err.is_unauthorized());

    let records = vfs.elevation_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ElevationKind::SetUid);
    assert_eq!(records[0].original_uid, 1000);
    assert_eq!(records[0].elevated_uid, Some(0));
    assert_eq!(records[0].outcome, ElevationOutcome::Granted);
    assert!(records[0].released_at.is_some());
}

#[tokio::test]
async fn test_untrusted_setuid_program_is_rejected() {
    let vfs = vfs();
    let sink = Arc::new(RecordingSink::default());
    vfs.subscribe(sink.clone());
    let mallory = user("mallory");

    let err = vfs
        .execute_as_owner(&mallory, "/home/mallory/fake-sudo", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    // Dot segments are resolved before the trusted path check
    let err = vfs
        .execute_as_owner(&mallory, "/usr/bin/../../home/mallory/fake-sudo", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let records = vfs.elevation_records();
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| matches!(r.outcome, ElevationOutcome::Denied { .. }) && r.elevated_uid.is_none()));
    assert_eq!(
        sink.types(),
        vec![EventType::ElevationDenied, EventType::ElevationDenied]
    );
}

#[tokio::test]
async fn test_elevation_requires_setuid_bit_and_execute() {
    let vfs = vfs();
    let alice = user("alice");

    let err = vfs
        .execute_as_owner(&alice, "/usr/bin/ls", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    let err = vfs
        .execute_as_owner(&alice, "/usr/bin/nope", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = vfs
        .execute_as_owner(&alice, "/usr/bin", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FsError::InvalidOperation {
            kind: InvalidKind::IsADirectory,
            ..
        }
    ));

    // Remove execute for others on sudo
    vfs.chmod(&root(), "/usr/bin/sudo", Mode::new(0o4750)).await.unwrap();
    let err = vfs
        .execute_as_owner(&alice, "/usr/bin/sudo", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn test_root_cannot_elevate_further() {
    let vfs = vfs();
    let alice = user("alice");

    let err = vfs
        .execute_as_owner(&root(), "/usr/bin/sudo", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());

    // Nested elevation from an already elevated root caller is refused as well
    let nested = vfs
        .execute_as_owner(&alice, "/usr/bin/sudo", |elevated| {
            let vfs = &vfs;
            async move {
                let inner = vfs
                    .execute_as_owner(&elevated, "/usr/bin/sudo", |_| async { Ok(()) })
                    .await;
                Ok(inner.is_err())
            }
        })
        .await
        .unwrap();
    assert!(nested);
}

#[tokio::test]
async fn test_execute_picks_elevation_from_mode_bits() {
    let vfs = vfs();
    let bob = user("bob");

    let plain = vfs
        .execute(&bob, "/usr/bin/ls", |caller| async move { Ok(caller.identity().clone()) })
        .await
        .unwrap();
    assert_eq!((plain.uid, plain.primary_gid), (1001, 1001));

    let setuid = vfs
        .execute(&bob, "/usr/bin/sudo", |caller| async move { Ok(caller.identity().clone()) })
        .await
        .unwrap();
    assert!(setuid.is_root());

    let setgid = vfs
        .execute(&bob, "/usr/bin/wall", |caller| async move { Ok(caller.identity().clone()) })
        .await
        .unwrap();
    assert_eq!((setgid.uid, setgid.primary_gid), (1001, 5));

    // Root-group setgid program inside a trusted directory
    let newgrp = vfs
        .execute(&bob, "/usr/bin/newgrp", |caller| async move { Ok(caller.identity().clone()) })
        .await
        .unwrap();
    assert_eq!((newgrp.uid, newgrp.primary_gid), (1001, 0));

    let as_root = vfs
        .execute(&root(), "/usr/bin/sudo", |caller| async move { Ok(caller.identity().clone()) })
        .await
        .unwrap();
    assert!(as_root.is_root());

    // Only bob's three elevations were recorded
    let kinds: Vec<_> = vfs.elevation_records().iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![ElevationKind::SetUid, ElevationKind::SetGid, ElevationKind::SetGid]
    );
}

#[tokio::test]
async fn test_elevation_event_names_original_caller() {
    let vfs = vfs();
    let sink = Arc::new(RecordingSink::default());
    vfs.subscribe(sink.clone());
    let alice = user("alice");

    vfs.execute_as_owner(&alice, "/usr/bin/sudo", |elevated| {
        let vfs = &vfs;
        async move { vfs.write_file(&elevated, "/var/log/audit.log", b"entry").await }
    })
    .await
    .unwrap();

    let elevated = sink.of_type(EventType::Elevated);
    assert_eq!(elevated.len(), 1);
    assert_eq!(elevated[0].actor, Some(1000));
    assert_eq!(elevated[0].path, "/usr/bin/sudo");

    let created = sink.of_type(EventType::Created);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].actor, Some(0));
    assert_eq!(vfs.get_file("/var/log/audit.log").unwrap().uid, 0);
}

#[tokio::test]
async fn test_failed_action_still_releases_elevation() {
    let vfs = vfs();
    let alice = user("alice");

    let err = vfs
        .execute_as_owner(&alice, "/usr/bin/sudo", |elevated| {
            let vfs = &vfs;
            async move { vfs.read_file(&elevated, "/etc/missing").await }
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(vfs.active_elevations().is_empty());
    assert!(vfs.elevation_records()[0].released_at.is_some());
}

#[tokio::test]
async fn test_cancelled_action_releases_elevation() {
    let vfs = Arc::new(vfs());
    let alice = user("alice");
    let observer = Arc::clone(&vfs);

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        vfs.execute_as_owner(&alice, "/usr/bin/sudo", move |elevated| async move {
            let active = observer.active_elevations();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].original().uid, 1000);
            assert_eq!(active[0].acting().uid, elevated.identity().uid);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }),
    )
    .await;
    assert!(result.is_err(), "action should have timed out");

    assert!(vfs.active_elevations().is_empty());
    let records = vfs.elevation_records();
    assert_eq!(records.len(), 1);
    assert!(records[0].released_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_tree() {
    let vfs = Arc::new(vfs());
    let mut handles = Vec::new();

    for i in 0..16 {
        let vfs = Arc::clone(&vfs);
        let caller = if i % 2 == 0 { user("alice") } else { user("bob") };
        handles.push(tokio::spawn(async move {
            let path = format!("/tmp/worker-{}", i);
            vfs.write_file(&caller, &path, format!("payload {}", i).as_bytes())
                .await?;
            vfs.append_file(&caller, &path, b"!").await?;
            vfs.read_file(&caller, &path).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let content = handle.await.unwrap().unwrap();
        assert_eq!(content, format!("payload {}!", i).into_bytes());
    }

    let entries = vfs.list_directory(&root(), "/tmp").await.unwrap();
    assert_eq!(entries.len(), 16);
    assert!(entries.iter().all(|e| !e.is_dir));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_arrive_in_mutation_order() {
    let vfs = Arc::new(vfs());
    let alice = user("alice");

    // A slow subscriber holds up delivery of the first batch
    let creating = Arc::new(Notify::new());
    let signal = Arc::clone(&creating);
    vfs.subscribe_fn(move |evt: &FilesystemEvent| {
        if evt.event_type == EventType::Created {
            signal.notify_one();
            std::thread::sleep(Duration::from_millis(300));
        }
    });
    let sink = Arc::new(RecordingSink::default());
    vfs.subscribe(sink.clone());

    let writer = {
        let vfs = Arc::clone(&vfs);
        let alice = alice.clone();
        tokio::spawn(async move { vfs.write_file(&alice, "/tmp/race", b"data").await })
    };
    creating.notified().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The file already exists, so the delete succeeds while Created is still in flight
    let deleter = {
        let vfs = Arc::clone(&vfs);
        tokio::spawn(async move { vfs.delete_file(&alice, "/tmp/race").await })
    };
    writer.await.unwrap().unwrap();
    deleter.await.unwrap().unwrap();

    let seen: Vec<_> = sink
        .events()
        .into_iter()
        .map(|evt| (evt.event_type, evt.path))
        .collect();
    assert_eq!(
        seen,
        vec![
            (EventType::Created, "/tmp/race".to_string()),
            (EventType::Deleted, "/tmp/race".to_string()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_see_per_file_event_order() {
    let vfs = Arc::new(vfs());
    let sink = Arc::new(RecordingSink::default());
    vfs.subscribe(sink.clone());
    let mut handles = Vec::new();

    for i in 0..8 {
        let vfs = Arc::clone(&vfs);
        let caller = if i % 2 == 0 { user("alice") } else { user("bob") };
        handles.push(tokio::spawn(async move {
            let path = format!("/tmp/churn-{}", i);
            vfs.write_file(&caller, &path, b"one").await?;
            vfs.append_file(&caller, &path, b"two").await?;
            vfs.delete_file(&caller, &path).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let events = sink.events();
    assert_eq!(events.len(), 24);
    for i in 0..8 {
        let path = format!("/tmp/churn-{}", i);
        let types: Vec<_> = events
            .iter()
            .filter(|evt| evt.path == path)
            .map(|evt| evt.event_type)
            .collect();
        assert_eq!(
            types,
            vec![EventType::Created, EventType::Written, EventType::Deleted],
            "events for {path}"
        );
    }
    assert!(events.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_elevations_are_independent() {
    let vfs = Arc::new(vfs());
    let mut handles = Vec::new();

    for i in 0..8u64 {
        let vfs = Arc::clone(&vfs);
        let caller = if i % 2 == 0 { user("alice") } else { user("bob") };
        handles.push(tokio::spawn(async move {
            let original = caller.identity().uid;
            let program = if i % 2 == 0 { "/usr/bin/sudo" } else { "/usr/bin/wall" };
            let seen = vfs
                .execute(&caller, program, |elevated| async move {
                    tokio::time::sleep(Duration::from_millis(5 * i)).await;
                    Ok(elevated.identity().clone())
                })
                .await?;
            Ok::<_, FsError>((original, seen))
        }));
    }

    for handle in handles {
        let (original, seen) = handle.await.unwrap().unwrap();
        match original {
            1000 => assert!(seen.is_root()),
            _ => assert_eq!((seen.uid, seen.primary_gid), (1001, 5)),
        }
    }

    assert!(vfs.active_elevations().is_empty());
    let records = vfs.elevation_records();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.released_at.is_some()));
}
