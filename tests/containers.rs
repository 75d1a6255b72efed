// Container test suite.
//
// Core invariants exercised:
// - Membership accounting: link adds exactly one reference, unlink or
//   search-driven removal releases exactly one, container destruction
//   releases one per remaining member.
// - Search: callback visits only the hashed bucket for object and hash
//   scans; outcomes return, unlink, or both; stop ends the scan.
// - Version: strictly increases across links and unlinks.
// - Validation: operations on a destroyed container or with a destroyed
//   object fail without touching the structure.
// - Reentrancy: member destructors may use the container that released
//   them; re-entering the bucket table from a match function panics.
use ao2::{
    match_by_pointer, Ao2, Ao2Error, CmpFlags, Container, KeyedContainer, Outcome, Position, Scan,
    Search,
};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, PartialEq)]
struct Item {
    id: u32,
    bucket: u64,
}

fn item(id: u32, bucket: u64) -> Ao2<Item> {
    Ao2::new(Item { id, bucket })
}

fn by_bucket(buckets: usize) -> Container<Item> {
    Container::builder()
        .buckets(buckets)
        .hash(|i: &Item| i.bucket)
        .compare(|m: &Item, p: &Item| {
            if m.id == p.id {
                CmpFlags::MATCH | CmpFlags::STOP
            } else {
                CmpFlags::empty()
            }
        })
        .build()
}

// Test: container round trip in single-bucket mode.
// Verifies: count tracks link/unlink; identity find returns the object
// with one more reference.
#[test]
fn round_trip_without_hash_or_compare() {
    let c: Container<[u8; 16]> = Container::new(100, None, None);
    let p = Ao2::new([1u8; 16]);
    c.link(&p).unwrap();
    assert_eq!(c.count(), 1);
    assert_eq!(p.ref_count(), 2);

    let found = c.find(&p, Outcome::Return).unwrap().expect("linked");
    assert!(Ao2::ptr_eq(&found, &p));
    assert_eq!(p.ref_count(), 3);
    drop(found);

    c.unlink(&p).unwrap();
    assert_eq!(c.count(), 0);
    assert_eq!(p.ref_count(), 1);
    assert!(c.find(&p, Outcome::Return).unwrap().is_none());
}

// Test: find with unlink, three members sharing one bucket.
// Verifies: only B is removed and returned with the container's reference;
// a later find for B fails and A, C stay linked.
#[test]
fn find_with_unlink_in_shared_bucket() {
    let c = by_bucket(8);
    let a = item(1, 3);
    let b = item(2, 3);
    let d = item(3, 3);
    for o in [&a, &b, &d] {
        c.link(o).unwrap();
    }
    assert_eq!(b.ref_count(), 2);

    let got = c
        .callback(Search::object(&*b).outcome(Outcome::UnlinkReturn), |o| {
            if o.id == 2 {
                CmpFlags::MATCH
            } else {
                CmpFlags::empty()
            }
        })
        .unwrap()
        .expect("B matched");
    assert!(Ao2::ptr_eq(&got, &b));
    assert_eq!(b.ref_count(), 2);
    assert_eq!(c.count(), 2);
    drop(got);
    assert_eq!(b.ref_count(), 1);

    assert!(c.find(&b, Outcome::Return).unwrap().is_none());
    assert!(c.contains(&a).unwrap());
    assert!(c.contains(&d).unwrap());
}

// Test: lookup with a value that is equal to a member but not linked itself.
#[test]
fn find_by_equal_value() {
    let c = by_bucket(4);
    let stored = item(10, 1);
    c.link(&stored).unwrap();
    let wanted = Item { id: 10, bucket: 1 };
    let hit = c.find(&wanted, Outcome::Return).unwrap().expect("key match");
    assert!(Ao2::ptr_eq(&hit, &stored));
    let wrong_bucket = Item { id: 10, bucket: 2 };
    assert!(c.find(&wrong_bucket, Outcome::Return).unwrap().is_none());
}

struct Peer {
    name: String,
    port: u16,
}

fn peers(c: &KeyedContainer<Peer, str>) -> Vec<Ao2<Peer>> {
    let peers: Vec<_> = ["alice", "bob", "carol", "dave"]
        .iter()
        .enumerate()
        .map(|(i, n)| {
            Ao2::new(Peer {
                name: n.to_string(),
                port: 5060 + i as u16,
            })
        })
        .collect();
    for p in &peers {
        c.link(p).unwrap();
    }
    peers
}

// Test: Container::keyed hashes and compares an extracted key.
// Verifies: lookups take a bare &str; no member-typed value is built.
#[test]
fn keyed_container_finds_by_str() {
    let c = Container::keyed(31, |p: &Peer| p.name.as_str());
    let peers = peers(&c);

    let bob = c.find_key("bob", Outcome::Return).unwrap().expect("bob");
    assert_eq!(bob.port, 5061);
    assert!(Ao2::ptr_eq(&bob, &peers[1]));
    drop(bob);

    let carol = c.find_key("carol", Outcome::Unlink).unwrap();
    assert!(carol.is_none());
    assert_eq!(c.count(), 3);
    assert_eq!(peers[2].ref_count(), 1);
    assert!(c.find_key("carol", Outcome::Return).unwrap().is_none());
    assert!(c.find_key("mallory", Outcome::Return).unwrap().is_none());

    let owned = String::from("dave");
    let dave = c.find_key(&owned, Outcome::UnlinkReturn).unwrap().expect("dave");
    assert_eq!(dave.port, 5063);
    assert_eq!(c.count(), 2);
}

// Test: the key hash agrees with the hash the container assigns members.
// Verifies: a raw hash scan built from a key visits that member; clones share keying.
#[test]
fn keyed_hash_matches_member_bucket() {
    let c = Container::keyed(7, |p: &Peer| p.name.as_str());
    let peers = peers(&c);
    let mut visited = Vec::new();
    c.callback_all(c.search_key("alice").outcome(Outcome::Visit), |p| {
        visited.push(p.name.clone());
        CmpFlags::MATCH
    })
    .unwrap();
    assert!(visited.iter().any(|n| n == "alice"));

    let other = c.clone();
    assert_eq!(other.key_hash("alice"), c.key_hash("alice"));
    let all_bob = other.find_key_all("bob", Outcome::Return).unwrap();
    assert_eq!(all_bob.len(), 1);
    assert!(Ao2::ptr_eq(&all_bob[0], &peers[1]));
}

// Test: callback_all collects every match across buckets.
// Verifies: Return outcome bumps each match once; Unlink removes them all.
#[test]
fn callback_all_matches() {
    let c = by_bucket(4);
    let items: Vec<_> = (0..12).map(|i| item(i, i as u64)).collect();
    for o in &items {
        c.link(o).unwrap();
    }
    let even = |o: &Ao2<Item>| {
        if o.id % 2 == 0 {
            CmpFlags::MATCH
        } else {
            CmpFlags::empty()
        }
    };
    let got = c.callback_all(Search::all(), even).unwrap();
    assert_eq!(got.len(), 6);
    assert!(got.iter().all(|o| o.ref_count() == 3));
    drop(got);

    let removed = c
        .callback_all(Search::all().outcome(Outcome::Unlink), even)
        .unwrap();
    assert!(removed.is_empty());
    assert_eq!(c.count(), 6);
    for o in &items {
        assert_eq!(o.ref_count(), if o.id % 2 == 0 { 1 } else { 2 });
    }
}

// Test: a hash scan only visits the bucket of that hash.
#[test]
fn hash_scan_limits_to_bucket() {
    let c = by_bucket(4);
    let items: Vec<_> = (0..8).map(|i| item(i, i as u64)).collect();
    for o in &items {
        c.link(o).unwrap();
    }
    let mut visited = Vec::new();
    c.callback_all(Search::hash(6).outcome(Outcome::Visit), |o| {
        visited.push(o.id);
        CmpFlags::MATCH
    })
    .unwrap();
    visited.sort_unstable();
    assert_eq!(visited, vec![2, 6]);

    let search = Search::<Item> {
        scan: Scan::All,
        outcome: Outcome::Visit,
    };
    let mut all = 0;
    c.callback_all(search, |_| {
        all += 1;
        CmpFlags::empty()
    })
    .unwrap();
    assert_eq!(all, 8);
}

// Test: head insertion places newest first in its bucket.
#[test]
fn head_insertion_order_within_bucket() {
    let c: Container<u32> = Container::new(1, None, None);
    let objs: Vec<_> = (0..3).map(Ao2::new).collect();
    c.link(&objs[0]).unwrap();
    c.link_at(&objs[1], Position::Head).unwrap();
    c.link(&objs[2]).unwrap();
    let mut order = Vec::new();
    c.callback_all(Search::all().outcome(Outcome::Visit), |o| {
        order.push(**o);
        CmpFlags::empty()
    })
    .unwrap();
    assert_eq!(order, vec![1, 0, 2]);
}

// Test: version monotonicity across a mixed sequence.
#[test]
fn version_strictly_increases() {
    let c = by_bucket(3);
    let items: Vec<_> = (0..10).map(|i| item(i, i as u64)).collect();
    let mut last = c.version();
    for (n, o) in items.iter().enumerate() {
        c.link(o).unwrap();
        assert!(c.version() > last);
        last = c.version();
        if n % 3 == 0 {
            c.unlink(o).unwrap();
            assert!(c.version() > last);
            last = c.version();
        }
    }
    let cleared = c.clear().unwrap();
    assert_eq!(cleared, 6);
    assert!(c.version() > last);
    assert!(c.is_empty());
}

// Test: unlinking an object that is not a member is a no-op.
#[test]
fn unlink_non_member() {
    let c = by_bucket(2);
    let a = item(1, 0);
    let stranger = item(1, 0);
    c.link(&a).unwrap();
    let v = c.version();
    c.unlink(&stranger).unwrap();
    assert_eq!(c.count(), 1);
    assert_eq!(c.version(), v);
    assert_eq!(stranger.ref_count(), 1);
}

// Test: an object linked into two containers holds one reference per
// membership.
#[test]
fn multiple_memberships() {
    let c1 = by_bucket(2);
    let c2: Container<Item> = Container::new(1, None, None);
    let o = item(5, 1);
    c1.link(&o).unwrap();
    c2.link(&o).unwrap();
    assert_eq!(o.ref_count(), 3);
    drop(c1);
    assert_eq!(o.ref_count(), 2);
    c2.unlink(&o).unwrap();
    assert_eq!(o.ref_count(), 1);
}

// Test: container destruction releases every member exactly once.
#[test]
fn destruction_releases_members() {
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    fn count(_: &u32) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }
    let c: Container<u32> = Container::new(5, Some(Box::new(|v: &u32| *v as u64)), None);
    let kept = Ao2::with_destructor(100, count);
    c.link(&kept).unwrap();
    for i in 0..20 {
        let o = Ao2::with_destructor(i, count);
        c.link(&o).unwrap();
    }
    let second = c.clone();
    assert_eq!(c.ref_count(), 2);
    drop(c);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
    drop(second);
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 20);
    assert_eq!(kept.ref_count(), 1);
}

// Test: the container's object handle shares its count and lock.
// Verifies: no internal type is needed to hold or lock the container object.
#[test]
fn container_object_handle() {
    let c: Container<u32> = Container::new(2, None, None);
    let handle = c.as_object().clone();
    assert_eq!(c.ref_count(), 2);
    {
        let _held = handle.lock().unwrap();
        let guard = c.lock().unwrap();
        assert_eq!(guard.iter().count(), 0);
    }
    drop(handle);
    assert_eq!(c.ref_count(), 1);
    c.link(&Ao2::new(3)).unwrap();
    assert_eq!(c.count(), 1);
}

// Test: a destroyed container rejects every operation.
#[test]
fn destroyed_container_is_invalid() {
    let c: Container<u32> = Container::new(1, None, None);
    let o = Ao2::new(1);
    c.link(&o).unwrap();
    let raw = c.as_object().as_ptr();
    raw.add_ref(-1).unwrap();
    assert_eq!(o.ref_count(), 1);
    assert_eq!(c.link(&o), Err(Ao2Error::InvalidObject));
    assert!(c.find(&o, Outcome::Return).is_err());
    assert!(c.callback(Search::all(), |_| CmpFlags::MATCH).is_err());
    assert!(c.iter().next().is_none());
    assert!(c.lock().is_err());
    // Dropping `c` would only log a release of a destroyed object.
    std::mem::forget(c);
}

// Test: linking a destroyed object fails and leaves the container as is.
#[test]
fn link_rejects_destroyed_object() {
    let c: Container<u32> = Container::new(1, None, None);
    let o = Ao2::new(1);
    let raw = o.as_ptr();
    raw.add_ref(-1).unwrap();
    assert_eq!(c.link(&o), Err(Ao2Error::InvalidObject));
    assert_eq!(c.count(), 0);
    assert_eq!(c.version(), 1);
    std::mem::forget(o);
}

// Test: a member destructor may use the container that released it.
#[test]
fn member_destructor_may_reenter_container() {
    use std::sync::Mutex;
    static SEEN: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    static HOME: Mutex<Option<Container<u32>>> = Mutex::new(None);
    fn note(_: &u32) {
        let home = HOME.lock().unwrap();
        if let Some(c) = home.as_ref() {
            SEEN.lock().unwrap().push(c.count());
        }
    }
    let c: Container<u32> = Container::new(1, None, None);
    *HOME.lock().unwrap() = Some(c.clone());
    let o = Ao2::with_destructor(1, note);
    c.link(&o).unwrap();
    c.link(&Ao2::with_destructor(2, note)).unwrap();
    drop(o);
    let removed = c.clear().unwrap();
    assert_eq!(removed, 2);
    assert_eq!(*SEEN.lock().unwrap(), vec![0, 0]);
    HOME.lock().unwrap().take();
}

// Test: a match function that re-enters the container panics instead of
// aliasing the bucket table; the container stays usable afterwards.
#[test]
fn reentrant_match_function_panics() {
    let c: Container<u32> = Container::new(1, None, None);
    let o = Ao2::new(1);
    c.link(&o).unwrap();
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = c.callback(Search::all(), |_| {
            let _ = c.link(&Ao2::new(2));
            CmpFlags::MATCH
        });
    }));
    assert!(res.is_err());
    assert_eq!(c.count(), 1);
    c.link(&Ao2::new(3)).unwrap();
    assert_eq!(c.count(), 2);
}

// Test: match_by_pointer distinguishes equal payloads.
#[test]
fn match_by_pointer_is_identity() {
    let c: Container<u32> = Container::new(1, None, None);
    let a = Ao2::new(7);
    let b = Ao2::new(7);
    c.link(&a).unwrap();
    c.link(&b).unwrap();
    let hit = c
        .callback(Search::all(), match_by_pointer(&b))
        .unwrap()
        .expect("b linked");
    assert!(Ao2::ptr_eq(&hit, &b));
    assert!(!Ao2::ptr_eq(&hit, &a));
}
