use std::io::Cursor;

use anyhow::Result;
use sharded_kv::{console::Console, Client, Server, ServerConfig};

fn transcript(client: &Client, script: &str) -> Result<String> {
    let mut output = Vec::new();
    Console::new(client).serve(Cursor::new(script), &mut output)?;
    Ok(String::from_utf8(output)?)
}

#[test]
fn data_commands_wait_for_login() -> Result<()> {
    let config = ServerConfig::new(2, 4, 2)?.with_listen("127.0.0.1:0".parse()?);
    let server = Server::bind(config)?.spawn()?;
    let client = Client::connect(server.local_addr())?;

    let output = transcript(
        &client,
        "put fruit apple\n\
         register carol pw\n\
         put fruit apple\n\
         get fruit\n\
         mput a 1 b 2\n\
         mget b a zz\n\
         get nothing\n\
         quit\n\
         get fruit\n",
    )?;

    assert_eq!(
        output,
        "*** registered as carol\n\
         ok\n\
         apple\n\
         ok\n\
         a = 1\n\
         b = 2\n\
         (nil)\n\
         bye\n"
    );
    assert_eq!(server.store().get("fruit").as_deref(), Some(&b"apple"[..]));
    assert_eq!(server.store().get("b").as_deref(), Some(&b"2"[..]));
    assert_eq!(server.store().user_shard_count(), 2);

    client.close()?;
    server.shutdown()
}

#[test]
fn failed_login_keeps_the_console_locked() -> Result<()> {
    let config = ServerConfig::new(2, 4, 1)?.with_listen("127.0.0.1:0".parse()?);
    let server = Server::bind(config)?.spawn()?;
    let client = Client::connect(server.local_addr())?;
    assert!(client.register("dave", "right")?);

    let output = transcript(&client, "login dave wrong\nget x\nlogin dave right\nget x\n")?;
    assert_eq!(output, "*** logged in as dave\n(nil)\n");

    client.close()?;
    server.shutdown()
}
