use bitcoin::{
    network::Network as BitcoinNetwork, secp256k1::{All, Secp256k1}, ScriptBuf, Transaction, TxOut,
};
use std::sync::mpsc::{self, Receiver, Sender};

use crate::{
    embed::{Embed, FrameMessage, FrameUpdate, MountedFrame},
    error::AppError,
    feed::{FeedMessage, LiveFeed, Subscription},
    indexer::IndexerClient,
    invoice::InvoiceClient,
    keys::{parse_address, KeyPair, PaymentKey},
    transaction::{build_output, build_sweep, TransactionInProgress, DEFAULT_FEE_PER_KB},
    types::{
        BroadcastResult, InputSource, Invoice, InvoiceRequest, OutputSource, PaymentEvent, PaymentState,
        UnspentOutput,
    },
};

const SATS_PER_BSV: u64 = 100_000_000;

/// ProxyPayment の構築オプション
#[derive(Debug, Clone)]
pub struct PaymentOptions {
    pub key: PaymentKey,
    pub network: BitcoinNetwork,
    pub inputs: Vec<InputSource>,
    pub outputs: Vec<OutputSource>,
    pub change_address: Option<String>,
    pub fee_per_kb: u64,
    pub description: Option<String>,
    /// 構築直後にフィードの購読を始める
    pub auto_listen: bool,
    /// 資金が揃ったら自動でブロードキャストする
    pub auto_broadcast: bool,
    /// 受信メッセージなどを info レベルで出力する
    pub debug: bool,
}

impl PaymentOptions {
    pub fn new(key: impl Into<PaymentKey>) -> Self {
        PaymentOptions {
            key: key.into(),
            network: BitcoinNetwork::Bitcoin,
            inputs: Vec::new(),
            outputs: Vec::new(),
            change_address: None,
            fee_per_kb: DEFAULT_FEE_PER_KB,
            description: None,
            auto_listen: true,
            auto_broadcast: true,
            debug: false,
        }
    }

    pub fn output(mut self, output: impl Into<OutputSource>) -> Self {
        self.outputs.push(output.into());
        self
    }

    pub fn input(mut self, input: impl Into<InputSource>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// 自動の購読・ブロードキャストを止め、呼び出し側が各操作を行う
    pub fn manual(mut self) -> Self {
        self.auto_listen = false;
        self.auto_broadcast = false;
        self
    }
}

/// 入金を待って署名・ブロードキャストする支払い
pub struct ProxyPayment {
    keys: KeyPair,
    secp: Secp256k1<All>,
    network: BitcoinNetwork,
    tx: TransactionInProgress,
    state: PaymentState,
    change_address: Option<String>,
    fee_per_kb: u64,
    description: Option<String>,
    auto_broadcast: bool,
    debug: bool,
    indexer: Box<dyn IndexerClient>,
    feed: Box<dyn LiveFeed>,
    invoices: Option<Box<dyn InvoiceClient>>,
    socket: Option<Box<dyn Subscription>>,
    invoice: Option<Invoice>,
    frame: Option<MountedFrame>,
    events: Sender<PaymentEvent>,
    receiver: Option<Receiver<PaymentEvent>>,
}

impl ProxyPayment {
    pub fn new(
        options: PaymentOptions,
        indexer: Box<dyn IndexerClient>,
        feed: Box<dyn LiveFeed>,
    ) -> Result<Self, AppError> {
        let secp = Secp256k1::new();
        let keys = KeyPair::from_key(&options.key, options.network, &secp)?;
        let change_script: ScriptBuf = match &options.change_address {
            Some(address) => parse_address(address, options.network)?.script_pubkey(),
            None => keys.locking_script(),
        };
        let (events, receiver) = mpsc::channel();

        let mut payment = ProxyPayment {
            tx: TransactionInProgress::new(change_script, options.fee_per_kb),
            keys,
            secp,
            network: options.network,
            state: PaymentState::Unfunded,
            change_address: options.change_address,
            fee_per_kb: options.fee_per_kb,
            description: options.description,
            auto_broadcast: options.auto_broadcast,
            debug: options.debug,
            indexer,
            feed,
            invoices: None,
            socket: None,
            invoice: None,
            frame: None,
            events,
            receiver: Some(receiver),
        };

        for output in options.outputs {
            payment.push_output(output)?;
        }
        for input in options.inputs {
            payment.push_input(input)?;
        }
        payment.estimate_fee();
        log::info!(
            "ProxyPayment を作成しました。アドレス: {}, 入力: {}, 出力: {}, 必要額: {} sats",
            payment.address(),
            payment.tx.inputs().len(),
            payment.tx.outputs().len(),
            payment.required_satoshis()
        );

        payment.emit(PaymentEvent::Created);
        if payment.is_funded() {
            payment.settle_funding();
        } else if options.auto_listen {
            payment.listen();
        }
        Ok(payment)
    }

    /// 構築して請求書を作成する
    pub fn create(
        options: PaymentOptions,
        indexer: Box<dyn IndexerClient>,
        feed: Box<dyn LiveFeed>,
        invoices: Box<dyn InvoiceClient>,
    ) -> Result<Self, AppError> {
        let mut payment = Self::new(options, indexer, feed)?.with_invoice_client(invoices);
        payment.create_invoice();
        Ok(payment)
    }

    /// 構築して既存の請求書を読み込む
    pub fn load(
        invoice_id: &str,
        options: PaymentOptions,
        indexer: Box<dyn IndexerClient>,
        feed: Box<dyn LiveFeed>,
        invoices: Box<dyn InvoiceClient>,
    ) -> Result<Self, AppError> {
        let mut payment = Self::new(options, indexer, feed)?.with_invoice_client(invoices);
        payment.load_invoice(invoice_id);
        Ok(payment)
    }

    pub fn with_invoice_client(mut self, invoices: Box<dyn InvoiceClient>) -> Self {
        self.invoices = Some(invoices);
        self
    }

    /// イベント受信側を取り出す (一度だけ)
    pub fn take_events(&mut self) -> Option<Receiver<PaymentEvent>> {
        self.receiver.take()
    }

    pub fn address(&self) -> String {
        self.keys.address().to_string()
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn state(&self) -> PaymentState {
        self.state
    }

    pub fn fee(&self) -> u64 {
        self.tx.fee()
    }

    pub fn inputs(&self) -> &[UnspentOutput] {
        self.tx.inputs()
    }

    pub fn outputs(&self) -> Vec<TxOut> {
        self.tx.outputs()
    }

    pub fn transaction(&self) -> Transaction {
        self.tx.to_unsigned()
    }

    pub fn total_satoshis(&self) -> u64 {
        self.tx.total_satoshis()
    }

    pub fn required_satoshis(&self) -> u64 {
        self.tx.required_satoshis()
    }

    pub fn funded_satoshis(&self) -> u64 {
        self.tx.input_amount().unwrap_or(0)
    }

    pub fn is_funded(&self) -> bool {
        self.tx.is_funded()
    }

    pub fn is_listening(&self) -> bool {
        self.socket.as_ref().is_some_and(|s| s.is_open())
    }

    pub fn bip21_uri(&self) -> String {
        format!("bitcoin:{}?sv&amount={}", self.address(), format_bsv(self.required_satoshis()))
    }

    pub fn invoice(&self) -> Option<&Invoice> {
        self.invoice.as_ref()
    }

    pub fn frame(&self) -> Option<&MountedFrame> {
        self.frame.as_ref()
    }

    pub fn add_output(&mut self, output: impl Into<OutputSource>) -> Result<(), AppError> {
        self.add_outputs([output.into()])
    }

    pub fn add_outputs<I>(&mut self, outputs: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = OutputSource>,
    {
        for output in outputs {
            self.push_output(output)?;
        }
        self.estimate_fee();
        self.settle_funding();
        Ok(())
    }

    pub fn add_input(&mut self, input: impl Into<InputSource>) -> Result<(), AppError> {
        self.add_inputs([input.into()])
    }

    pub fn add_inputs<I>(&mut self, inputs: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = InputSource>,
    {
        for input in inputs {
            self.push_input(input)?;
        }
        self.estimate_fee();
        self.settle_funding();
        Ok(())
    }

    pub fn estimate_fee(&mut self) -> u64 {
        self.tx.estimate_fee()
    }

    fn push_output(&mut self, output: OutputSource) -> Result<(), AppError> {
        let tx_out = match output {
            OutputSource::Spec(spec) => build_output(&spec, self.network)?,
            OutputSource::Normalized(tx_out) => tx_out,
        };
        self.tx.push_output(tx_out);
        self.tx.estimate_fee();
        Ok(())
    }

    fn push_input(&mut self, input: InputSource) -> Result<(), AppError> {
        let utxo = input.into_unspent()?;
        if self.tx.contains(&utxo) {
            log::debug!("既に追加済みの入力を無視します: {}:{}", utxo.txid, utxo.output_index);
            return Ok(());
        }
        self.tx.push_input(utxo);
        self.tx.estimate_fee();
        Ok(())
    }

    /// UTXO を一つずつ取り込み、資金が揃った時点で打ち切る
    fn fold_utxos<I>(&mut self, utxos: I) -> Result<usize, AppError>
    where
        I: IntoIterator<Item = UnspentOutput>,
    {
        let mut added = 0;
        for utxo in utxos {
            if self.is_funded() {
                break;
            }
            self.push_input(InputSource::Normalized(utxo))?;
            added += 1;
        }
        Ok(added)
    }

    /// Unfunded → Funded への遷移ごとに一度だけ Funded を通知する
    fn settle_funding(&mut self) {
        match self.state {
            PaymentState::Unfunded if self.is_funded() => {
                log::info!("資金が揃いました。入力合計: {} sats", self.funded_satoshis());
                self.state = PaymentState::Funded;
                self.emit(PaymentEvent::Funded);
                if self.auto_broadcast {
                    self.broadcast();
                }
            }
            PaymentState::Funded if !self.is_funded() => {
                log::warn!("出力の追加により資金が不足しました。必要額: {} sats", self.required_satoshis());
                self.state = PaymentState::Unfunded;
            }
            _ => {}
        }
    }

    pub fn listen(&mut self) {
        if let Err(e) = self.open_socket() {
            log::error!("フィードの購読に失敗しました: {}", e);
            self.emit(PaymentEvent::Error(e));
        }
    }

    fn open_socket(&mut self) -> Result<(), AppError> {
        if !self.is_listening() {
            let address = self.address();
            self.socket = Some(self.feed.listen(&address, None)?);
        }
        if let Some(socket) = &self.socket {
            self.trace(format_args!("Open: {}", socket.url()));
        }
        Ok(())
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.close();
            let url = socket.url().to_string();
            self.trace(format_args!("Close: {}", url));
        }
    }

    /// フィードのメッセージ一件を取り込む
    pub fn handle_feed_message(&mut self, message: FeedMessage) {
        if self.state.is_terminal() {
            self.trace(format_args!("Ignored: {:?}", self.state));
            return;
        }
        let address = self.address();
        let script = self.keys.locking_script();
        for feed_tx in &message.data {
            self.trace(format_args!("Tx: {}", feed_tx.tx.h));
            let utxos = feed_tx.outputs_paying(&address, &script);
            if let Err(e) = self.fold_utxos(utxos) {
                self.emit(PaymentEvent::Error(e));
                return;
            }
            if self.is_funded() {
                break;
            }
        }
        self.settle_funding();
    }

    /// 購読が終わるか、未入金の状態を抜けるまでメッセージを処理する
    pub fn run_feed(&mut self) -> PaymentState {
        while self.state == PaymentState::Unfunded {
            let next = match self.socket.as_mut() {
                Some(socket) if socket.is_open() => socket.next_message(),
                _ => break,
            };
            match next {
                Some(Ok(message)) => self.handle_feed_message(message),
                Some(Err(e)) => {
                    log::warn!("フィードのエラー: {}", e);
                    self.emit(PaymentEvent::Error(e));
                }
                None => break,
            }
        }
        self.state
    }

    /// インデクサに一度だけ問い合わせて UTXO を取り込む
    pub fn get_utxo(&mut self) -> PaymentState {
        if self.state.is_terminal() {
            return self.state;
        }
        let address = self.address();
        match self.indexer.get_utxo(&address) {
            Ok(utxos) => {
                self.trace(format_args!("Utxos: {}", utxos.len()));
                match self.fold_utxos(utxos) {
                    Ok(_) => self.settle_funding(),
                    Err(e) => self.emit(PaymentEvent::Error(e)),
                }
            }
            Err(e) => {
                log::error!("UTXOの取得に失敗しました: {}", e);
                self.emit(PaymentEvent::Error(e));
            }
        }
        self.state
    }

    pub fn broadcast(&mut self) -> PaymentState {
        self.trace(format_args!("Broadcasting"));
        self.state = PaymentState::Broadcasting;
        let result = self.sign_and_send();
        self.close_socket();
        match result {
            Ok(result) => {
                log::info!("支払いが完了しました: {}", result.txid);
                self.state = PaymentState::Settled;
                self.emit(PaymentEvent::Payment(result));
            }
            Err(e) => {
                log::error!("ブロードキャストに失敗しました: {}", e);
                self.state = PaymentState::Errored;
                self.emit(PaymentEvent::Error(e));
            }
        }
        self.state
    }

    fn sign_and_send(&self) -> Result<BroadcastResult, AppError> {
        if !self.is_funded() {
            return Err(AppError::InsufficientFunds {
                available: self.funded_satoshis(),
                required: self.total_satoshis(),
                fee: self.fee(),
            });
        }
        let signed = self.tx.sign(&self.keys, &self.secp)?;
        self.indexer.broadcast_tx(&signed)
    }

    /// アドレス上の全UTXOを一つの出力にまとめて送る。支払いの状態には影響しない
    pub fn sweep(&mut self, destination: Option<&str>) -> Result<(), AppError> {
        let destination = destination
            .map(str::to_string)
            .or_else(|| self.change_address.clone())
            .ok_or_else(|| AppError::Configuration("送金先のアドレスを指定してください".to_string()))?;
        let destination_script = parse_address(&destination, self.network)?.script_pubkey();
        log::info!("スイープを開始します: {} -> {}", self.address(), destination);

        let result = self
            .indexer
            .get_utxo(&self.address())
            .and_then(|utxos| build_sweep(utxos, destination_script, self.fee_per_kb, &self.keys, &self.secp))
            .and_then(|signed| self.indexer.broadcast_tx(&signed));
        self.close_socket();
        match result {
            Ok(result) => self.emit(PaymentEvent::Payment(result)),
            Err(e) => {
                log::error!("スイープに失敗しました: {}", e);
                self.emit(PaymentEvent::Error(e));
            }
        }
        Ok(())
    }

    pub fn invoice_request(&self) -> InvoiceRequest {
        InvoiceRequest {
            satoshis: self.required_satoshis(),
            script: self.keys.locking_script().to_hex_string(),
            description: self.description.clone(),
        }
    }

    pub fn create_invoice(&mut self) {
        let request = self.invoice_request();
        self.trace(format_args!("Creating invoice: {:?}", request));
        let result = match &self.invoices {
            Some(client) => client.create_invoice(&request),
            None => Err(missing_invoice_client()),
        };
        self.store_invoice(result);
    }

    pub fn load_invoice(&mut self, invoice_id: &str) {
        self.trace(format_args!("Loading invoice: {}", invoice_id));
        let result = match &self.invoices {
            Some(client) => client.load_invoice(invoice_id),
            None => Err(missing_invoice_client()),
        };
        self.store_invoice(result);
    }

    fn store_invoice(&mut self, result: Result<Invoice, AppError>) {
        match result {
            Ok(invoice) => {
                log::info!("請求書を取得しました: {:?} ({} sats)", invoice.id, invoice.satoshis);
                self.invoice = Some(invoice.clone());
                self.emit(PaymentEvent::Invoice(invoice));
            }
            Err(e) => {
                log::error!("請求書の取得に失敗しました: {}", e);
                self.emit(PaymentEvent::Error(e));
            }
        }
    }

    /// 読み込み済みの請求書に iframe を取り付け、送るべき初期メッセージを返す
    pub fn mount(&mut self, embed: Embed) -> Result<Vec<FrameMessage>, AppError> {
        let invoice = self
            .invoice
            .as_ref()
            .ok_or_else(|| AppError::Configuration("請求書が読み込まれていません".to_string()))?;
        let frame = embed.mount(invoice)?;
        let messages = frame.handshake();
        self.trace(format_args!("Mounted: {} -> {}", frame.selector(), frame.src()));
        self.frame = Some(frame);
        Ok(messages)
    }

    pub fn handle_frame_message(&mut self, origin: &str, raw: &str) -> Option<FrameUpdate> {
        self.frame.as_mut()?.handle_message(origin, raw)
    }

    fn emit(&self, event: PaymentEvent) {
        if self.events.send(event).is_err() {
            log::debug!("イベントの受信側が破棄されています。");
        }
    }

    fn trace(&self, args: std::fmt::Arguments<'_>) {
        let level = if self.debug { log::Level::Info } else { log::Level::Debug };
        log::log!(level, "{}", args);
    }
}

fn missing_invoice_client() -> AppError {
    AppError::Configuration("請求書クライアントが設定されていません".to_string())
}

/// satoshi を BSV 単位の文字列にする (末尾の0は省く)
fn format_bsv(satoshis: u64) -> String {
    let whole = satoshis / SATS_PER_BSV;
    let fraction = satoshis % SATS_PER_BSV;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{:08}", fraction);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}
