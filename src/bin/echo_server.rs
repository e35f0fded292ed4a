//! A minimal demo embedder: accepts connections and replies to every request
//! with a generic error result, closing on Unbind. Exists to exercise
//! `Server`/`Handler` end to end, not as a usable directory server.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use ldap_core::{Context, Handler, LdapOp, LdapResult, LdapResultCode, Message, ResponseWriter, Server};

#[derive(Parser, Debug)]
#[command(name = "ldap-echo-server")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = ldap_core::DEFAULT_PORT)]
    port: u16,
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn serve(&self, ctx: Context, response: ResponseWriter, message: Message) {
        if ctx.is_cancelled() {
            return;
        }

        let op = match message.op() {
            LdapOp::BindRequest(_) => LdapOp::BindResponse(unsupported_result()),
            LdapOp::SearchRequest(_) => LdapOp::SearchResultDone(unsupported_result()),
            _ => LdapOp::ExtendedResponse(ldap3_proto::LdapExtendedResponse {
                res: unsupported_result(),
                name: None,
                value: None,
            }),
        };

        response.write(op).await;
    }
}

fn unsupported_result() -> LdapResult {
    LdapResult {
        code: LdapResultCode::UnwillingToPerform,
        matcheddn: String::new(),
        message: "ldap-echo-server implements no operations".to_string(),
        referral: Vec::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let address: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let server = Server::builder()
        .connection_handler(|_peer: SocketAddr| Some(Arc::new(EchoHandler) as Arc<dyn Handler>))
        .build();

    server.listen_and_serve(&address.to_string()).await?;
    Ok(())
}
