use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use sticker_swap::{
    collection::CollectionService,
    config::{create_default_config_file, AppConfig},
    context::{ExchangeContext, Session},
    discovery::OfferDiscovery,
    exchange::{ExchangeService, ResolveProgress},
    matcher::ExchangeMatcher,
    model::RecordRef,
};
use tracing::error;

#[derive(Parser)]
#[command(name = "sticker-swap")]
#[command(about = "Barter sealed stickers between personal repositories")]
struct Cli {
    #[arg(short, long, default_value = "sticker-swap.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mint your own sticker and join the registry
    Init {
        #[arg(long)]
        avatar: Option<String>,
        /// Also write a default configuration file if none exists
        #[arg(long)]
        write_config: bool,
    },
    /// List the verified stickers of a party (yourself by default)
    Collection { did: Option<String> },
    /// Offer stickers to a partner, or to anyone with --easy and no partner
    Offer {
        #[arg(long)]
        partner: Option<String>,
        #[arg(long = "item", required = true)]
        items: Vec<String>,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        easy: bool,
        /// Also publish a post mentioning the partner
        #[arg(long)]
        post: bool,
    },
    /// Accept a partner's open offer
    Accept {
        partner: String,
        #[arg(long)]
        offer: Option<String>,
        #[arg(long = "give")]
        give: Vec<String>,
        #[arg(long)]
        message: Option<String>,
    },
    /// Reject a partner's open offer
    Reject {
        partner: String,
        #[arg(long)]
        offer: Option<String>,
    },
    /// Delete one of your unanswered offers
    Withdraw { offer: String },
    /// Reconcile your open offers with your partners' answers
    Resolve,
    /// Show open offers addressed to you
    Incoming,
    /// Look for an anonymous exchange partner
    Match {
        #[arg(long = "item")]
        items: Vec<String>,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },
    /// Delete all of your stickers, transactions and registry data
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

fn parse_refs(values: &[String]) -> sticker_swap::Result<Vec<RecordRef>> {
    values.iter().map(|value| value.parse()).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Init { write_config: true, .. } = &cli.command {
        if !cli.config.exists() {
            create_default_config_file(&cli.config)?;
            println!("Wrote default configuration to {}", cli.config.display());
        }
    }

    let config = if cli.config.exists() {
        AppConfig::load_with_env_overrides(&cli.config)?
    } else {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config
    };
    config.validate()?;
    config.logging.install();

    let ctx = ExchangeContext::from_config(&config)?;
    let session = Session::from_config(&config)?;

    if let Err(e) = run(cli.command, ctx, session).await {
        error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn run(command: Command, ctx: ExchangeContext, session: Session) -> sticker_swap::Result<()> {
    let me = session.did.clone();

    match command {
        Command::Init { avatar, .. } => {
            let collection = CollectionService::new(ctx, session);
            if collection.initialize(avatar).await? {
                println!("Initialized collection for {}", me);
            } else {
                println!("{} is already initialized", me);
            }
        }
        Command::Collection { did } => {
            let holder = did.unwrap_or_else(|| me.clone());
            let view = CollectionService::new(ctx, session).items_of(&holder).await?;
            println!("{} verified stickers held by {}:", view.visible.len(), holder);
            for entry in &view.visible {
                println!(
                    "  {} model={} from={} image={}",
                    entry.uri,
                    entry.item.model,
                    entry.item.obtained_from.as_deref().unwrap_or("-"),
                    entry.image_url.as_deref().unwrap_or("-")
                );
            }
            for (uri, reason) in &view.hidden {
                println!("  hidden {}: {}", uri, reason);
            }
        }
        Command::Offer { partner, items, message, easy, post } => {
            let items = parse_refs(&items)?;
            let exchange = ExchangeService::new(ctx, session);
            let offer = exchange
                .create_offer(partner.as_deref(), &items, message, easy)
                .await?;
            println!("Offer created: {}", offer);

            match (post, partner.as_deref()) {
                (true, Some(partner)) => {
                    let announcement = exchange.announce_offer(partner, items.len()).await?;
                    println!("Announced: {}", announcement);
                }
                (true, None) => println!("Anonymous offers are not announced"),
                _ => {}
            }
        }
        Command::Accept { partner, offer, give, message } => {
            let offer = offer.map(|o| o.parse::<RecordRef>()).transpose()?;
            let give = parse_refs(&give)?;
            let outcome = ExchangeService::new(ctx, session)
                .accept_offer(&partner, &give, message, offer.as_ref())
                .await?;
            println!(
                "Accepted {}: received {} new, {} already held, {} failed",
                outcome.offer,
                outcome.report.created.len(),
                outcome.report.already_held,
                outcome.report.failed
            );
        }
        Command::Reject { partner, offer } => {
            let offer = offer.map(|o| o.parse::<RecordRef>()).transpose()?;
            let rejection = ExchangeService::new(ctx, session)
                .reject_offer(&partner, offer.as_ref())
                .await?;
            println!("Rejection recorded: {}", rejection);
        }
        Command::Withdraw { offer } => {
            let offer: RecordRef = offer.parse()?;
            ExchangeService::new(ctx, session).withdraw_offer(&offer).await?;
            println!("Offer withdrawn: {}", offer);
        }
        Command::Resolve => {
            let summary = ExchangeService::new(ctx, session)
                .resolve_pending(|event| match event {
                    ResolveProgress::Scanning { open_offers } => println!("Checking {} open offers", open_offers),
                    ResolveProgress::Completed { offer, partner, received } => {
                        println!("  {} completed by {} ({} stickers received)", offer, partner, received)
                    }
                    ResolveProgress::Rejected { offer, partner } => println!("  {} rejected by {}", offer, partner),
                    ResolveProgress::Pending { offer } => println!("  {} still pending", offer),
                    ResolveProgress::Checking { .. } => {}
                })
                .await?;
            println!(
                "{} completed, {} rejected, {} pending",
                summary.completed.len(),
                summary.rejected.len(),
                summary.pending.len()
            );
        }
        Command::Incoming => {
            let offers = OfferDiscovery::new(ctx, session).incoming_offers().await;
            println!("{} open offers for you:", offers.len());
            for offer in offers {
                let from = offer
                    .profile
                    .as_ref()
                    .map(|p| p.handle.clone())
                    .unwrap_or_else(|| offer.partner.clone());
                println!(
                    "  {} from {}: {} verified stickers{}",
                    offer.uri,
                    from,
                    offer.items.len(),
                    offer.offer.message.map(|m| format!(" \"{}\"", m)).unwrap_or_default()
                );
                for (uri, reason) in &offer.unverified {
                    println!("    unverified {}: {}", uri, reason);
                }
            }
        }
        Command::Match { items, exclude } => {
            let wanted: HashSet<RecordRef> = parse_refs(&items)?.into_iter().collect();
            let view = CollectionService::new(ctx.clone(), session).items_of(&me).await?;
            let offered: Vec<_> = view
                .visible
                .into_iter()
                .filter(|entry| wanted.is_empty() || wanted.contains(&entry.uri))
                .map(|entry| entry.item)
                .collect();
            let excluded: HashSet<String> = exclude.into_iter().collect();

            match ExchangeMatcher::new(ctx, me).find_partner(&offered, &excluded).await? {
                Some(candidate) => println!(
                    "{} match: {} offers {} ({} stickers)",
                    if candidate.perfect { "Perfect" } else { "Partial" },
                    candidate.did,
                    candidate.offer,
                    candidate.transaction.sticker_out.len()
                ),
                None => println!("No partner found"),
            }
        }
        Command::Purge { yes } => {
            if !yes {
                println!("Refusing to delete everything without --yes");
                return Ok(());
            }
            let deleted = CollectionService::new(ctx, session).purge().await?;
            println!("Deleted {} records", deleted);
        }
    }

    Ok(())
}
