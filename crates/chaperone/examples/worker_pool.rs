// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shares one dictionary across several peer threads through a pooled
//! wrapper, then shuts down and recovers the object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use chaperone::{Args, Error, Invocation, Payload, Receiver, Wrapper};

struct Dictionary {
    entries: Mutex<HashMap<String, String>>,
}

impl Receiver for Dictionary {
    fn receive(&self, mut invocation: Invocation<'_>) -> chaperone::Result<Payload> {
        let mut args = invocation.take_args();
        match invocation.method() {
            "insert" => {
                let key: String = args.take(0)?.downcast()?;
                let value: String = args.take(1)?.downcast()?;
                self.entries.lock().expect("entries lock").insert(key, value);
                Ok(Payload::unit())
            }
            "fetch" => {
                let key: String = args.take(0)?.downcast()?;
                match self.entries.lock().expect("entries lock").get(&key) {
                    Some(value) => Ok(Payload::new(value.clone())),
                    None => Err(Error::raised(format!("no entry for `{key}`"))),
                }
            }
            "len" => Ok(Payload::new(
                self.entries.lock().expect("entries lock").len() as u64,
            )),
            other => Err(Error::NoSuchMethod(other.to_owned())),
        }
    }

    fn responds_to(&self, method: &str) -> bool {
        matches!(method, "insert" | "fetch" | "len")
    }
}

fn main() -> chaperone::Result<()> {
    let wrapper = Arc::new(
        Wrapper::wrap(Dictionary {
            entries: Mutex::new(HashMap::new()),
        })
        .with_name("dictionary")
        .with_threads(4)
        .start(),
    );

    let peers: Vec<_> = (0..4)
        .map(|peer| {
            let wrapper = Arc::clone(&wrapper);
            thread::spawn(move || -> chaperone::Result<()> {
                for n in 0..8 {
                    wrapper.call(
                        "insert",
                        &mut Args::new()
                            .arg(format!("key-{peer}-{n}"))
                            .arg(format!("value-{n}")),
                    )?;
                }
                Ok(())
            })
        })
        .collect();
    for peer in peers {
        peer.join().expect("peer panicked")?;
    }

    let len: u64 = wrapper.call("len", &mut Args::new())?.downcast()?;
    println!("{len} entries inserted through `{}`", wrapper.name());

    let value: String = wrapper
        .call("fetch", &mut Args::new().arg("key-0-0".to_owned()))?
        .downcast()?;
    println!("key-0-0 = {value}");

    wrapper.async_stop().join();
    let dictionary = wrapper.recover_object()?;
    println!(
        "recovered dictionary with {} entries",
        dictionary.entries.lock().expect("entries lock").len()
    );
    Ok(())
}
