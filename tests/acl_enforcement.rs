//! Access-control behavior through the public service surface.

use syftbox_sync::acl::{AccessLevel, AclService, FileRef};
use syftbox_sync::aclspec;

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

fn service_with_split_datasite() -> AclService {
    let svc = AclService::new();
    let rs = aclspec::parse(
        r#"
terminal: true
rules:
  - pattern: "public/**"
    access: { read: ["*"] }
  - pattern: "**"
    access: {}
"#,
        ALICE,
    )
    .unwrap();
    svc.load_rule_set(&rs).unwrap();
    svc
}

#[test]
fn public_subtree_is_world_readable_private_is_not() {
    let svc = service_with_split_datasite();

    let public = FileRef::file(format!("{ALICE}/public/a.txt"), 16);
    let private = FileRef::file(format!("{ALICE}/private/a.txt"), 16);

    assert!(svc.can_access(BOB, &public, AccessLevel::Read));
    assert!(!svc.can_access(BOB, &private, AccessLevel::Read));
    assert!(!svc.can_access(BOB, &public, AccessLevel::Write));
}

#[test]
fn acl_document_writes_need_admin() {
    let svc = service_with_split_datasite();
    let acl_file = FileRef::file(format!("{ALICE}/public/syft.pub.yaml"), 256);

    // Bob can read the rules file (read grant covers the elevated level)
    // but cannot rewrite it.
    assert!(svc.can_access(BOB, &acl_file, AccessLevel::Read));
    assert!(!svc.can_access(BOB, &acl_file, AccessLevel::Write));

    // The owner can always rewrite their own rules.
    assert!(svc.can_access(ALICE, &acl_file, AccessLevel::Write));
}

#[test]
fn owner_passes_every_level_everywhere() {
    let svc = service_with_split_datasite();
    for path in [
        format!("{ALICE}/private/secret.bin"),
        format!("{ALICE}/public/a.txt"),
        format!("{ALICE}/anything/else"),
    ] {
        let file = FileRef::file(path, 1 << 40);
        for level in [
            AccessLevel::Read,
            AccessLevel::Write,
            AccessLevel::Admin,
            AccessLevel::ReadAcl,
            AccessLevel::WriteAcl,
        ] {
            assert!(svc.can_access(ALICE, &file, level));
        }
    }
}

#[test]
fn terminal_ruleset_shadows_deeper_grants() {
    let svc = service_with_split_datasite();

    // A deeper ruleset tries to open the private subtree; the terminal root
    // ruleset keeps it invisible during resolution.
    let deeper = aclspec::parse(
        "rules:\n  - pattern: '**'\n    access: { read: ['*'] }\n",
        &format!("{ALICE}/private"),
    )
    .unwrap();
    svc.load_rule_set(&deeper).unwrap();

    let private = FileRef::file(format!("{ALICE}/private/a.txt"), 16);
    assert!(!svc.can_access(BOB, &private, AccessLevel::Read));
}

#[test]
fn ruleset_replacement_takes_effect_immediately() {
    let svc = service_with_split_datasite();
    let public = FileRef::file(format!("{ALICE}/public/a.txt"), 16);
    assert!(svc.can_access(BOB, &public, AccessLevel::Read));

    // Lock the datasite down; the cached resolution must not survive.
    let locked = aclspec::parse("terminal: true\nrules:\n  - pattern: '**'\n    access: {}\n", ALICE)
        .unwrap();
    svc.load_rule_set(&locked).unwrap();
    assert!(!svc.can_access(BOB, &public, AccessLevel::Read));
}

#[test]
fn limits_apply_to_foreign_writers_only_at_write_time() {
    let svc = AclService::new();
    let rs = aclspec::parse(
        r#"
rules:
  - pattern: "inbox/**"
    access: { write: ["*"] }
    limits: { maxFileSize: 4096 }
"#,
        ALICE,
    )
    .unwrap();
    svc.load_rule_set(&rs).unwrap();

    let ok = FileRef::file(format!("{ALICE}/inbox/small.bin"), 4096);
    let too_big = FileRef::file(format!("{ALICE}/inbox/large.bin"), 4097);

    assert!(svc.can_access(BOB, &ok, AccessLevel::Write));
    assert!(!svc.can_access(BOB, &too_big, AccessLevel::Write));
    assert!(svc.can_access(BOB, &too_big, AccessLevel::Read));
    // The owner ignores limits entirely.
    assert!(svc.can_access(ALICE, &too_big, AccessLevel::Write));
}
