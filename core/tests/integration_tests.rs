//! Library-level properties exercised through the public API

use p10d_core::config::{Config, PasswordHasher};
use p10d_core::message::{Command, Message, MAX_LINE};
use p10d_core::pool::{Pool, Reclaim};
use p10d_core::{Entity, EntityStatus};

fn sample_toml() -> String {
    format!(
        r#"
        [server]
        name = "irc.example"
        description = "integration"
        numeric = 2

        [[class]]
        name = "default"
        max_links = 50

        [[class]]
        name = "servers"
        max_links = 5
        sendq_limit = 1048576

        [[client]]
        host = "*.example"
        class = "default"

        [[client]]
        host = "*"
        class = "default"

        [[connect]]
        name = "hub.example"
        host = "10.0.0.1"
        port = 4400
        password = "linkpass"
        class = "servers"
        hub_limit = "*.example"

        [[operator]]
        name = "root"
        host = "*.admin.example"
        password_hash = "{}"
        class = "default"
        privileges = ["kill", "rehash"]
        "#,
        PasswordHasher::hash_password("sesame")
    )
}

#[test]
fn config_order_is_preserved() {
    let config = Config::from_toml(&sample_toml()).unwrap();
    // the first matching block wins, so order in the file is policy
    assert_eq!(config.items[0].host, "*.example");
    assert_eq!(config.items[1].host, "*");
}

#[test]
fn wire_format_round_trips_both_dialects() {
    let original = Message::parse(":alice!a@host.example PRIVMSG #ops :hello there").unwrap();

    let client_form = original.to_client_line();
    let reparsed = Message::parse(client_form.trim_end()).unwrap();
    assert_eq!(reparsed.command, Command::PrivMsg);
    assert_eq!(reparsed.params, original.params);

    let server_form = original.to_server_line();
    assert!(server_form.starts_with(":alice!a@host.example P "));
    let reparsed = Message::parse(server_form.trim_end()).unwrap();
    assert_eq!(reparsed.command, Command::PrivMsg);
    assert_eq!(reparsed.params, original.params);
}

#[test]
fn no_rendered_line_exceeds_the_limit() {
    for len in [1usize, 400, 508, 509, 510, 600, 2000] {
        let msg = Message::new(Command::PrivMsg, vec!["#ops".to_string(), "y".repeat(len)]);
        let line = msg.to_client_line();
        assert!(line.len() <= MAX_LINE, "len {} produced {}", len, line.len());
        assert!(line.ends_with("\r\n"));
    }
}

#[test]
fn pool_round_trip_preserves_cell_count() {
    let mut pool: Pool<Entity> = Pool::with_capacity(16);
    let before = pool.stats();

    let mut held = Vec::new();
    for i in 0..16 {
        let mut e = pool.acquire();
        e.status = EntityStatus::Unknown;
        e.name = format!("u{}", i);
        held.push(e);
    }
    assert_eq!(pool.stats().in_use, 16);
    for mut e in held {
        e.reset();
        pool.release(e);
    }
    assert_eq!(pool.stats(), before);
}
