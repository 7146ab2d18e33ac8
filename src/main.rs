use bitcoin::consensus::encode;
use clap::Parser;
use std::sync::mpsc::Receiver;

mod cli;

use cli::{parse_network, CliArgs, Command};
use proxypay::{
    config::PaymentConfig,
    embed::Embed,
    feed::BitSocketFeed,
    indexer::MatterCloudClient,
    invoice::HttpInvoiceClient,
    AppError, PaymentEvent, PaymentOptions, ProxyPayment,
};

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let config = PaymentConfig::from_file(&args.config)?;
    log::debug!("設定ファイルのパース成功: {:?}", config);

    let network_str = args
        .network
        .as_deref()
        .or(config.network.as_deref())
        .unwrap_or("bitcoin");
    let network = parse_network(network_str)?;
    log::info!("指定されたネットワーク: {:?}", network);

    let endpoints = &config.endpoints;
    let indexer = Box::new(MatterCloudClient::new(&endpoints.indexer_url, endpoints.api_key.clone())?);
    let feed = Box::new(BitSocketFeed::new(&endpoints.feed_url)?);

    // 各サブコマンドが購読・ブロードキャストの契機を自分で決める
    let options: PaymentOptions = config.to_options(network).manual();
    let mut payment = ProxyPayment::new(options, indexer, feed)?;
    let events = payment
        .take_events()
        .ok_or_else(|| AppError::Internal("イベント受信側を取得できません".to_string()))?;

    match args.command {
        Command::Address => {
            println!("{}", payment.address());
        }
        Command::Quote => {
            println!("address:  {}", payment.address());
            println!("fee:      {} sats", payment.fee());
            println!("total:    {} sats", payment.total_satoshis());
            println!("required: {} sats", payment.required_satoshis());
            println!("uri:      {}", payment.bip21_uri());
            println!("unsigned: {}", encode::serialize_hex(&payment.transaction()));
        }
        Command::Pay { poll } => {
            println!("{}", payment.bip21_uri());
            if poll {
                payment.get_utxo();
            } else if !payment.is_funded() {
                payment.listen();
                payment.run_feed();
            }
            if payment.is_funded() {
                payment.broadcast();
            } else {
                log::warn!("入金が確認できませんでした。必要額: {} sats", payment.required_satoshis());
            }
        }
        Command::Sweep { to } => {
            payment.sweep(to.as_deref())?;
        }
        Command::Invoice { load, selector } => {
            let invoices = Box::new(HttpInvoiceClient::new(&endpoints.invoice_url)?);
            payment = payment.with_invoice_client(invoices);
            match load {
                Some(id) => payment.load_invoice(&id),
                None => payment.create_invoice(),
            }
            if payment.invoice().is_some() {
                let embed = Embed::new(&selector, &endpoints.frame_origin)?;
                for message in payment.mount(embed)? {
                    log::debug!("iframe へ送るメッセージ: {:?}", message);
                }
                if let Some(frame) = payment.frame() {
                    println!("{}", frame.to_html());
                }
            }
        }
    }

    drain_events(&events)?;
    log::info!("処理が正常に完了しました。");
    Ok(())
}

/// 溜まったイベントを出力し、最後のエラーを返す
fn drain_events(events: &Receiver<PaymentEvent>) -> Result<(), AppError> {
    let mut last_error = None;
    for event in events.try_iter() {
        match event {
            PaymentEvent::Created => log::debug!("イベント: Created"),
            PaymentEvent::Funded => log::info!("イベント: Funded"),
            PaymentEvent::Payment(result) => {
                println!("{}", result.txid);
            }
            PaymentEvent::Invoice(invoice) => {
                log::info!("イベント: Invoice {:?}", invoice.id);
            }
            PaymentEvent::Error(e) => {
                log::error!("イベント: Error {}", e);
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
