use crate::owner::{ActiveOwners, IoRequestOwner};
use crate::test::*;

#[test]
fn test_ring_round_robin() {
    let mut ring = ActiveOwners::new();
    assert_eq!(ring.advance(), None);
    assert_eq!(ring.current(), None);
    ring.push(3);
    ring.push(5);
    ring.push(7);
    assert_eq!(ring.current(), None);
    assert_eq!(ring.advance(), Some(3));
    assert_eq!(ring.current(), Some(3));
    assert_eq!(ring.advance(), Some(5));
    assert_eq!(ring.advance(), Some(7));
    assert_eq!(ring.advance(), Some(3));
}

#[test]
fn test_ring_remove_current() {
    let mut ring = ActiveOwners::new();
    for slot in [1, 2, 3] {
        ring.push(slot);
    }
    assert_eq!(ring.advance(), Some(1));
    assert_eq!(ring.advance(), Some(2));
    assert!(ring.remove(2));
    // The marker stays put, the successor is next.
    assert_eq!(ring.current(), None);
    assert_eq!(ring.advance(), Some(3));
    assert_eq!(ring.advance(), Some(1));
    assert!(!ring.remove(2));
}

#[test]
fn test_ring_remove_others() {
    let mut ring = ActiveOwners::new();
    for slot in [1, 2, 3, 4] {
        ring.push(slot);
    }
    ring.advance();
    ring.advance();
    ring.advance();
    assert_eq!(ring.current(), Some(3));
    assert!(ring.remove(1));
    assert_eq!(ring.current(), Some(3));
    assert!(ring.remove(4));
    assert_eq!(ring.current(), Some(3));
    assert_eq!(ring.advance(), Some(2));
    assert_eq!(ring.len(), 2);
}

#[test]
fn test_ring_remove_last_current_wraps() {
    let mut ring = ActiveOwners::new();
    ring.push(1);
    ring.push(2);
    ring.advance();
    assert_eq!(ring.advance(), Some(2));
    ring.remove(2);
    assert_eq!(ring.advance(), Some(1));
    ring.remove(1);
    assert!(ring.is_empty());
    assert_eq!(ring.advance(), None);
    ring.push(9);
    assert_eq!(ring.advance(), Some(9));
}

#[test]
fn test_owner_activity() {
    let mut owner = IoRequestOwner::new();
    assert!(!owner.is_active());
    let request = write_request(1, 0, 512, 0);
    owner.requests.push_back(request.clone());
    assert!(owner.is_active());
    assert!(owner.has_schedulable_work());
    owner.complete_head(&request);
    assert!(owner.requests.is_empty());
    assert!(owner.is_active());
    assert!(!owner.has_schedulable_work());
    assert!(owner.remove_request(&request));
    assert!(!owner.is_active());
    assert!(!owner.remove_request(&request));
}

#[test]
fn test_owner_dump() {
    let mut owner = IoRequestOwner::new();
    owner.team = 4;
    owner.thread = Some(42);
    owner.requests.push_back(write_request(42, 0, 1024, 0));
    let mut out = String::new();
    owner.dump(7, &mut out).unwrap();
    assert!(out.starts_with("owner 7"));
    assert!(out.contains("thread:   42"));
    assert!(out.contains("request#"));
}
