//! Drive the coordination engine end-to-end with an in-process mock chat
//! transport: register a session, submit a request, simulate the human's
//! button press, and poll the decision.
//!
//! Run with: `cargo run --example mock_broker`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use greenlight::telegram::format_prompt;
use greenlight::{
    ChatTransport, Coordinator, Error, HitlRequest, InMemoryStore, ReplySelection,
    RequestRegistry, SessionDirectory, SubmitParams,
};

/// Stand-in transport that prints prompts instead of calling Telegram.
struct ConsoleTransport;

impl ChatTransport for ConsoleTransport {
    fn send_prompt<'a>(
        &'a self,
        human_address: i64,
        request: &'a HitlRequest,
    ) -> Pin<Box<dyn Future<Output = Result<i32, Error>> + Send + 'a>> {
        Box::pin(async move {
            println!("--- prompt to {human_address} ---");
            println!("{}", format_prompt(request));
            for (index, option) in request.options.iter().enumerate() {
                println!("  [{index}] {option}");
            }
            println!("---");
            Ok(1)
        })
    }

    fn acknowledge<'a>(
        &'a self,
        human_address: i64,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            println!("(ack to {human_address}: {text})");
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let store = Arc::new(InMemoryStore::new());
    let directory = Arc::new(SessionDirectory::new(store.clone()));
    let registry = Arc::new(RequestRegistry::new(store));
    let coordinator = Arc::new(Coordinator::new(
        directory.clone(),
        registry,
        Arc::new(ConsoleTransport),
        300,
        100,
    ));

    directory.register("demo-session", "demo-agent", 42)?;

    let request = coordinator
        .submit(SubmitParams {
            session_id: "demo-session".into(),
            client_id: "demo-agent".into(),
            message: "Deploy build 1042 to production?".into(),
            options: vec!["Deploy".into(), "Cancel".into()],
            ..Default::default()
        })
        .await?;
    println!("submitted request {}", request.id);

    // The human presses the first button.
    coordinator.deliver_reply(request.id, ReplySelection::Choice { option_index: 0 })?;

    let decided = coordinator.poll(request.id)?;
    println!(
        "status: {:?}, response: {}, approved: {}",
        decided.status,
        decided.response.as_deref().unwrap_or("-"),
        decided.approved
    );
    Ok(())
}
