//! Integration tests for accounts: folder bookkeeping over a message store.

use std::path::{Path, PathBuf};

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

use msgstore::account::Account;
use msgstore::config::Config;
use msgstore::error::StoreError;
use msgstore::model::field::{CacheField, IndexField};
use msgstore::parser::message::Message;
use msgstore::store::{default_index_source, CheckInput, IndexSource, Layout};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn load_fixture(name: &str) -> Message {
    Message::from_file(fixture(name)).unwrap()
}

fn open(dir: &TempDir, layout: Layout) -> Account {
    Account::open(dir.path(), layout, &Config::default()).unwrap()
}

/// Fails the summary of the message at `position`, defers to the stored header otherwise.
fn failing_at(position: usize) -> impl FnMut(&CheckInput) -> msgstore::error::Result<IndexSource> {
    move |input| {
        if input.position == position {
            Err(StoreError::HeaderUnreadable {
                position,
                reason: "simulated".into(),
            })
        } else {
            default_index_source(input)
        }
    }
}

// ─── Summary fields ─────────────────────────────────────────────────

#[test]
fn test_decoded_fields() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Multi);
    let id = account
        .store_message(&load_fixture("multipart.eml"), "inbox", false)
        .unwrap();

    assert_eq!(account.get_data(id, CacheField::From).unwrap(), "José García");
    assert_eq!(
        account.get_data(id, CacheField::Subject).unwrap(),
        "Informe trimestral"
    );
    assert_eq!(
        account.get_index(id, IndexField::Subject).unwrap(),
        "=?UTF-8?Q?Informe_trimestral?="
    );
    assert_eq!(
        account.get_index(id, IndexField::MessageId).unwrap(),
        "<multi001@example.com>"
    );
    assert_eq!(
        account.get_data(id, CacheField::Reference).unwrap(),
        "<reply1@example.com>"
    );
    assert_eq!(account.get_index(id, IndexField::Label).unwrap(), "inbox");
}

#[test]
fn test_set_label_keeps_other_fields() {
    for layout in [Layout::Single, Layout::Multi] {
        let dir = TempDir::new().unwrap();
        let mut account = open(&dir, layout);
        let id = account
            .store_message(&load_fixture("multipart.eml"), "inbox", false)
            .unwrap();
        let before = account.messages()[0].location;

        account.set_label(id, "work").unwrap();
        let after = account.messages()[0].location;
        assert_eq!(after.offset, before.offset);
        assert_eq!(account.get_index(id, IndexField::Label).unwrap(), "work");
        assert_eq!(
            account.get_index(id, IndexField::MessageId).unwrap(),
            "<multi001@example.com>"
        );
        assert_eq!(account.get_data(id, CacheField::From).unwrap(), "José García");
        assert_eq!(
            account.get_data(id, CacheField::Subject).unwrap(),
            "Informe trimestral"
        );
    }
}

#[test]
fn test_replace_subject_updates_cache() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Single);
    let id = account
        .store_message(&load_fixture("simple.eml"), "", false)
        .unwrap();
    assert_eq!(account.get_data(id, CacheField::Subject).unwrap(), "Hello World");

    account
        .replace_index_field(id, IndexField::Subject, "=?UTF-8?Q?Hola_mundo?=")
        .unwrap();
    assert_eq!(account.get_data(id, CacheField::Subject).unwrap(), "Hola mundo");
    assert_eq!(account.get_data(id, CacheField::From).unwrap(), "User One");
}

// ─── Message lifecycle ──────────────────────────────────────────────

#[test]
fn test_update_message_keeps_label() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Multi);
    let id = account
        .store_message(&load_fixture("simple.eml"), "drafts", false)
        .unwrap();
    let old = account.messages()[0].location;

    let edited = load_fixture("multipart.eml");
    account.update_message(id, &edited).unwrap();
    let new = account.messages()[0].location;
    assert_ne!(new.offset, old.offset);
    assert_eq!(account.load_message(id).unwrap(), edited);
    assert_eq!(account.get_index(id, IndexField::Label).unwrap(), "drafts");
    assert!(matches!(
        account.store().load(old.offset, old.length),
        Err(StoreError::Io { .. })
    ));
}

#[test]
fn test_demote_keeps_summary() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Single);
    let id = account
        .store_message(&load_fixture("simple.eml"), "", false)
        .unwrap();

    account.demote_message(id).unwrap();
    assert!(matches!(account.load_message(id), Err(StoreError::NoBody)));
    assert_eq!(account.get_data(id, CacheField::Subject).unwrap(), "Hello World");
    let stats = account.stats().unwrap();
    assert_eq!(stats.index_only, 1);
    assert_eq!(stats.store.body_bytes, 0);
}

#[test]
fn test_delete_message() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Single);
    let id = account
        .store_message(&load_fixture("simple.eml"), "", false)
        .unwrap();
    account.delete_message(id).unwrap();

    assert!(account.messages().is_empty());
    assert!(matches!(
        account.delete_message(id),
        Err(StoreError::MessageNotFound(_))
    ));
    let stats = account.stats().unwrap();
    assert_eq!(stats.store.body_bytes + stats.store.index_bytes, 0);
}

// ─── Check ──────────────────────────────────────────────────────────

#[test]
fn test_check_ignores_unreadable_header() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Multi);
    let keep = account
        .store_message(&load_fixture("simple.eml"), "inbox", false)
        .unwrap();
    let drop = account
        .store_message(&load_fixture("multipart.eml"), "", false)
        .unwrap();
    let dropped_path = dir.child(format!(
        "msg/00000000/{:08}.msg",
        account.messages()[1].location.offset
    ));
    dropped_path.assert(predicate::path::is_file());
    let index_before = account.stats().unwrap().store.index_bytes;

    let summary = account.check_with(&mut failing_at(1), true, None).unwrap();
    assert_eq!(summary.rebuilt, 1);
    assert_eq!(summary.removed, vec![drop]);

    assert_eq!(account.messages().len(), 1);
    assert_eq!(account.messages()[0].id, keep);
    assert_eq!(account.get_index(keep, IndexField::Label).unwrap(), "inbox");
    assert!(account.stats().unwrap().store.index_bytes < index_before);
    dropped_path.assert(predicate::path::missing());
}

#[test]
fn test_check_without_ignore_leaves_folder() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Single);
    account
        .store_message(&load_fixture("simple.eml"), "", false)
        .unwrap();
    account
        .store_message(&load_fixture("multipart.eml"), "", false)
        .unwrap();
    let before = account.messages().to_vec();

    let result = account.check_with(&mut failing_at(0), false, None);
    assert!(matches!(result, Err(StoreError::HeaderUnreadable { .. })));
    assert_eq!(account.messages(), &before[..]);
    for handle in &before {
        assert!(account.load_message(handle.id).is_ok());
    }
}

#[test]
fn test_check_rebuilds_index_only_messages() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Single);
    let id = account
        .store_message(&load_fixture("multipart.eml"), "archive", true)
        .unwrap();

    let summary = account.check(false, None).unwrap();
    assert_eq!(summary.rebuilt, 1);
    assert_eq!(account.get_index(id, IndexField::Label).unwrap(), "archive");
    assert_eq!(account.get_data(id, CacheField::From).unwrap(), "José García");
}

// ─── Maintenance ────────────────────────────────────────────────────

#[test]
fn test_compact_and_reopen() {
    let dir = TempDir::new().unwrap();
    let ids = {
        let mut account = open(&dir, Layout::Single);
        let first = account
            .store_message(&load_fixture("simple.eml"), "", false)
            .unwrap();
        let second = account
            .store_message(&load_fixture("multipart.eml"), "inbox", false)
            .unwrap();
        account.delete_message(first).unwrap();
        account.compact(None).unwrap();
        assert_eq!(account.messages()[0].location.offset, 0);
        vec![second]
    };
    dir.child("folder.idx").assert(predicate::path::is_file());

    // The folder layout wins over the requested one.
    let mut account = open(&dir, Layout::Multi);
    assert_eq!(account.layout(), Layout::Single);
    assert_eq!(account.messages().len(), 1);
    assert_eq!(
        account.load_message(ids[0]).unwrap(),
        load_fixture("multipart.eml")
    );
    assert_eq!(account.get_index(ids[0], IndexField::Label).unwrap(), "inbox");
}

#[test]
fn test_salvage_and_free_unreferenced() {
    let dir = TempDir::new().unwrap();
    {
        let mut account = open(&dir, Layout::Multi);
        account
            .store_message(&load_fixture("simple.eml"), "", false)
            .unwrap();
    }
    // A body written behind the folder's back.
    dir.child("msg/00000000/00000002.msg")
        .write_binary(load_fixture("multipart.eml").as_bytes())
        .unwrap();

    let mut account = open(&dir, Layout::Multi);
    let ids = account.salvage(None).unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(account.messages().len(), 2);
    assert_eq!(
        account.get_data(ids[0], CacheField::Subject).unwrap(),
        "Informe trimestral"
    );

    let before = account.stats().unwrap().store.index_bytes;
    account.free_unreferenced().unwrap();
    account.free_unused().unwrap();
    assert_eq!(account.stats().unwrap().store.index_bytes, before);
    assert_eq!(account.stats().unwrap().store.message_files, Some(2));
}

#[test]
fn test_decoded_rendition_written_once() {
    let dir = TempDir::new().unwrap();
    let mut account = open(&dir, Layout::Multi);
    let id = account
        .store_message(&load_fixture("multipart.eml"), "", false)
        .unwrap();
    assert_eq!(account.load_decoded(id).unwrap(), None);

    account.save_decoded(id, b"first").unwrap();
    account.save_decoded(id, b"second").unwrap();
    assert_eq!(account.load_decoded(id).unwrap().as_deref(), Some(&b"first"[..]));
}
