use bitcoin::{secp256k1::Secp256k1, Network, ScriptBuf, Transaction, Txid};
use proxypay::{
    embed::{Embed, FrameUpdate, DEFAULT_FRAME_ORIGIN},
    feed::{FeedMessage, LiveFeed, Subscription},
    indexer::IndexerClient,
    invoice::InvoiceClient,
    keys::{KeyPair, PaymentKey},
    types::InvoiceRequest,
    AppError, BroadcastResult, DataItem, Invoice, OutputSpec, PaymentEvent, PaymentOptions, PaymentState,
    ProxyPayment, UnspentOutput,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::str::FromStr;

const WIF: &str = "L4JEtjzPy1uHdmDN4cV9K8WReWX2QaSYLEPzoZCmKRW6Hpe1zWgo";
const ADDRESS: &str = "1ML7LKjt3MMsZWVeuVbUZqoLCezqdAFW9e";
const OTHER_ADDRESS: &str = "1NbL18PU1r3kjVzLzh44Hkuj6nc36RBZ8Z";

#[derive(Default)]
struct IndexerState {
    utxos: Vec<UnspentOutput>,
    utxo_error: Option<AppError>,
    broadcast_error: Option<AppError>,
    broadcasts: Vec<Transaction>,
}

#[derive(Clone, Default)]
struct FakeIndexer(Rc<RefCell<IndexerState>>);

impl IndexerClient for FakeIndexer {
    fn get_utxo(&self, _address: &str) -> Result<Vec<UnspentOutput>, AppError> {
        let mut state = self.0.borrow_mut();
        match state.utxo_error.take() {
            Some(e) => Err(e),
            None => Ok(state.utxos.clone()),
        }
    }

    fn broadcast_tx(&self, tx: &Transaction) -> Result<BroadcastResult, AppError> {
        let mut state = self.0.borrow_mut();
        if let Some(e) = state.broadcast_error.take() {
            return Err(e);
        }
        state.broadcasts.push(tx.clone());
        Ok(BroadcastResult {
            txid: tx.compute_txid(),
            response: serde_json::json!({ "txid": tx.compute_txid().to_string() }),
        })
    }
}

#[derive(Default)]
struct FeedState {
    listened: Vec<String>,
    messages: VecDeque<FeedMessage>,
    open: bool,
    fail: bool,
}

#[derive(Clone, Default)]
struct FakeFeed(Rc<RefCell<FeedState>>);

impl LiveFeed for FakeFeed {
    fn listen(&self, address: &str, _amount: Option<u64>) -> Result<Box<dyn Subscription>, AppError> {
        let mut state = self.0.borrow_mut();
        if state.fail {
            return Err(AppError::Service { status: 503, message: "unavailable".into() });
        }
        state.listened.push(address.to_string());
        state.open = true;
        Ok(Box::new(FakeSubscription(self.0.clone())))
    }
}

struct FakeSubscription(Rc<RefCell<FeedState>>);

impl Subscription for FakeSubscription {
    fn url(&self) -> &str {
        "fake://feed"
    }

    fn next_message(&mut self) -> Option<Result<FeedMessage, AppError>> {
        self.0.borrow_mut().messages.pop_front().map(Ok)
    }

    fn close(&mut self) {
        self.0.borrow_mut().open = false;
    }

    fn is_open(&self) -> bool {
        self.0.borrow().open
    }
}

struct FakeInvoices {
    requests: Rc<RefCell<Vec<InvoiceRequest>>>,
}

impl InvoiceClient for FakeInvoices {
    fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, AppError> {
        self.requests.borrow_mut().push(request.clone());
        Ok(Invoice {
            id: Some("inv-1".into()),
            satoshis: request.satoshis,
            script: request.script.clone(),
            description: request.description.clone(),
            invoice_url: Some(format!("{}/pay/inv-1", DEFAULT_FRAME_ORIGIN)),
        })
    }

    fn load_invoice(&self, id: &str) -> Result<Invoice, AppError> {
        Err(AppError::Service { status: 404, message: format!("not found: {}", id) })
    }
}

fn data_output() -> OutputSpec {
    OutputSpec::data([DataItem::from("foo"), DataItem::from("bar")])
}

fn options() -> PaymentOptions {
    PaymentOptions::new(WIF).output(data_output())
}

fn foreign_script() -> ScriptBuf {
    ScriptBuf::from_hex("76a914dee7c0f7b8b6c5ec2d1c0f3c2ea2c1e4d32e3b0f88ac").unwrap()
}

fn utxo(n: u8, satoshis: u64, script: &ScriptBuf) -> UnspentOutput {
    UnspentOutput {
        txid: Txid::from_str(&format!("{:064x}", n)).unwrap(),
        output_index: 0,
        satoshis,
        script: script.clone(),
    }
}

fn feed_message(n: u8, values: &[(&str, u64)]) -> FeedMessage {
    let out: Vec<serde_json::Value> = values
        .iter()
        .enumerate()
        .map(|(i, (a, v))| serde_json::json!({ "i": i, "e": { "a": a, "v": v } }))
        .collect();
    serde_json::from_value(serde_json::json!({
        "type": "push",
        "data": [{ "tx": { "h": format!("{:064x}", n) }, "out": out }]
    }))
    .unwrap()
}

fn build(options: PaymentOptions) -> (ProxyPayment, FakeIndexer, FakeFeed) {
    let indexer = FakeIndexer::default();
    let feed = FakeFeed::default();
    let payment = ProxyPayment::new(options, Box::new(indexer.clone()), Box::new(feed.clone())).unwrap();
    (payment, indexer, feed)
}

fn drain(payment: &mut ProxyPayment) -> Vec<PaymentEvent> {
    payment.take_events().unwrap().try_iter().collect()
}

#[test]
fn quote_for_data_only_payment() {
    let (payment, _, feed) = build(options().manual());

    assert_eq!(payment.address(), ADDRESS);
    assert_eq!(payment.fee(), 210);
    assert_eq!(payment.total_satoshis(), 547);
    assert_eq!(payment.required_satoshis(), 547);
    assert_eq!(payment.bip21_uri(), format!("bitcoin:{}?sv&amount=0.00000547", ADDRESS));
    assert_eq!(payment.state(), PaymentState::Unfunded);
    assert!(payment.inputs().is_empty());
    assert!(feed.0.borrow().listened.is_empty());
}

#[test]
fn construction_starts_listening_by_default() {
    let (mut payment, _, feed) = build(options());

    assert_eq!(feed.0.borrow().listened, vec![ADDRESS.to_string()]);
    assert!(payment.is_listening());
    let events = drain(&mut payment);
    assert!(matches!(events.as_slice(), [PaymentEvent::Created]));
}

#[test]
fn listen_failure_is_reported_but_not_terminal() {
    let indexer = FakeIndexer::default();
    let feed = FakeFeed::default();
    feed.0.borrow_mut().fail = true;
    let mut payment = ProxyPayment::new(options(), Box::new(indexer), Box::new(feed)).unwrap();

    assert_eq!(payment.state(), PaymentState::Unfunded);
    let events = drain(&mut payment);
    assert!(matches!(events.as_slice(), [PaymentEvent::Created, PaymentEvent::Error(e)] if e.is_service()));
}

#[test]
fn exact_input_funds_without_change() {
    let keys = KeyPair::from_key(&PaymentKey::from(WIF), Network::Bitcoin, &Secp256k1::new()).unwrap();
    let (mut payment, _, _) = build(options().manual().input(utxo(1, 600, &keys.locking_script())));

    assert_eq!(payment.fee(), 176);
    assert_eq!(payment.total_satoshis(), 547);
    assert_eq!(payment.required_satoshis(), 0);
    assert!(payment.is_funded());
    assert_eq!(payment.outputs().len(), 1);
    assert_eq!(payment.state(), PaymentState::Funded);
    let events = drain(&mut payment);
    assert!(matches!(events.as_slice(), [PaymentEvent::Created, PaymentEvent::Funded]));
}

#[test]
fn oversized_input_adds_change() {
    let (mut payment, _, _) = build(options().manual());
    let script = payment.keys().locking_script();
    payment.add_input(utxo(1, 1500, &script)).unwrap();

    let outputs = payment.outputs();
    assert_eq!(payment.fee(), 210);
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[1].value.to_sat(), 1290);
    assert_eq!(outputs[1].script_pubkey, script);
    assert_eq!(payment.total_satoshis(), 1500);
}

#[test]
fn additional_payment_output_raises_total() {
    let (payment, _, _) = build(options().manual().output(OutputSpec::to(OTHER_ADDRESS, 5000)));

    assert_eq!(payment.fee(), 244);
    assert_eq!(payment.total_satoshis(), 5244);
    assert_eq!(payment.required_satoshis(), 5244);
    assert_eq!(payment.bip21_uri(), format!("bitcoin:{}?sv&amount=0.00005244", ADDRESS));
}

#[test]
fn partial_input_keeps_dust_floor_on_requirement() {
    let (mut payment, _, _) = build(options().manual());
    let script = payment.keys().locking_script();
    payment.add_input(utxo(1, 300, &script)).unwrap();

    assert_eq!(payment.fee(), 176);
    assert_eq!(payment.required_satoshis(), 547);
    assert_eq!(payment.funded_satoshis(), 300);
    assert_eq!(payment.state(), PaymentState::Unfunded);
}

#[test]
fn extra_output_can_unfund_a_funded_payment() {
    let (mut payment, _, _) = build(options().manual());
    let script = payment.keys().locking_script();
    payment.add_input(utxo(1, 600, &script)).unwrap();
    assert_eq!(payment.state(), PaymentState::Funded);

    payment.add_output(OutputSpec::to(OTHER_ADDRESS, 5000)).unwrap();
    assert_eq!(payment.state(), PaymentState::Unfunded);
    assert!(payment.required_satoshis() > 0);
}

#[test]
fn duplicate_inputs_are_ignored() {
    let (mut payment, _, _) = build(options().manual());
    let script = payment.keys().locking_script();
    payment.add_inputs([utxo(1, 300, &script).into(), utxo(1, 300, &script).into()]).unwrap();

    assert_eq!(payment.inputs().len(), 1);
}

#[test]
fn polling_folds_until_funded() {
    let (mut payment, indexer, _) = build(options().manual());
    let script = payment.keys().locking_script();
    indexer.0.borrow_mut().utxos = vec![utxo(1, 1300, &script), utxo(2, 900, &script)];

    assert_eq!(payment.get_utxo(), PaymentState::Funded);
    assert_eq!(payment.inputs().len(), 1);
    assert_eq!(payment.outputs().len(), 2);
    assert_eq!(payment.outputs()[1].value.to_sat(), 1090);
}

#[test]
fn polling_failure_becomes_event() {
    let (mut payment, indexer, _) = build(options().manual());
    indexer.0.borrow_mut().utxo_error = Some(AppError::Service { status: 500, message: "boom".into() });

    assert_eq!(payment.get_utxo(), PaymentState::Unfunded);
    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Error(AppError::Service { status: 500, .. }))));
}

#[test]
fn feed_batch_stops_once_funded_and_fires_funded_once() {
    let mut options = options();
    options.auto_broadcast = false;
    let (mut payment, _, _) = build(options);

    payment.handle_feed_message(feed_message(1, &[(ADDRESS, 1300), (OTHER_ADDRESS, 5000), (ADDRESS, 900)]));
    assert_eq!(payment.inputs().len(), 1);
    assert_eq!(payment.inputs()[0].satoshis, 1300);

    payment.handle_feed_message(feed_message(2, &[(ADDRESS, 700)]));
    assert_eq!(payment.inputs().len(), 1);

    let funded = drain(&mut payment)
        .into_iter()
        .filter(|e| matches!(e, PaymentEvent::Funded))
        .count();
    assert_eq!(funded, 1);
}

#[test]
fn feed_ignores_outputs_for_other_addresses() {
    let (mut payment, _, _) = build(options().manual());
    payment.handle_feed_message(feed_message(1, &[(OTHER_ADDRESS, 5000)]));

    assert!(payment.inputs().is_empty());
    assert_eq!(payment.state(), PaymentState::Unfunded);
}

#[test]
fn autonomous_pipeline_broadcasts_and_closes_feed() {
    let (mut payment, indexer, feed) = build(options());
    feed.0.borrow_mut().messages.push_back(feed_message(1, &[(ADDRESS, 1300)]));

    assert_eq!(payment.run_feed(), PaymentState::Settled);
    assert!(!feed.0.borrow().open);
    assert!(!payment.is_listening());

    let state = indexer.0.borrow();
    let broadcasts = &state.broadcasts;
    assert_eq!(broadcasts.len(), 1);
    let signed = &broadcasts[0];
    assert_eq!(signed.input.len(), 1);
    assert_eq!(signed.output.len(), 2);
    assert!(!signed.input[0].script_sig.is_empty());

    let events = drain(&mut payment);
    assert!(matches!(
        events.as_slice(),
        [PaymentEvent::Created, PaymentEvent::Funded, PaymentEvent::Payment(result)] if result.txid == signed.compute_txid()
    ));
}

#[test]
fn listening_twice_reuses_open_subscription() {
    let (mut payment, _, feed) = build(options());
    payment.listen();
    payment.listen();

    assert_eq!(feed.0.borrow().listened.len(), 1);
    assert!(payment.is_listening());
}

#[test]
fn listening_after_close_opens_new_subscription() {
    let (mut payment, _, feed) = build(options());
    let script = payment.keys().locking_script();
    payment.add_input(utxo(1, 1300, &script)).unwrap();
    assert_eq!(payment.state(), PaymentState::Settled);
    assert!(!payment.is_listening());

    payment.listen();
    assert_eq!(feed.0.borrow().listened.len(), 2);
    assert!(payment.is_listening());
}

#[test]
fn settled_payment_ignores_late_funds() {
    let (mut payment, indexer, _) = build(options());
    let script = payment.keys().locking_script();
    payment.add_input(utxo(1, 1300, &script)).unwrap();
    assert_eq!(payment.state(), PaymentState::Settled);

    payment.handle_feed_message(feed_message(2, &[(ADDRESS, 900)]));
    indexer.0.borrow_mut().utxos = vec![utxo(3, 700, &script)];
    assert_eq!(payment.get_utxo(), PaymentState::Settled);

    assert_eq!(payment.inputs().len(), 1);
    assert_eq!(indexer.0.borrow().broadcasts.len(), 1);
}

#[test]
fn input_covering_only_no_change_fee_settles() {
    let (mut payment, indexer, _) = build(options().output(OutputSpec::to(OTHER_ADDRESS, 5000)));
    let script = payment.keys().locking_script();
    payment.add_input(utxo(1, 5230, &script)).unwrap();

    assert_eq!(payment.fee(), 210);
    assert_eq!(payment.required_satoshis(), 0);
    assert_eq!(payment.state(), PaymentState::Settled);
    let state = indexer.0.borrow();
    assert_eq!(state.broadcasts[0].output.len(), 2);
}

#[test]
fn rejected_broadcast_is_errored() {
    let (mut payment, indexer, feed) = build(options());
    indexer.0.borrow_mut().broadcast_error =
        Some(AppError::Service { status: 400, message: "txn-mempool-conflict".into() });
    let script = payment.keys().locking_script();
    payment.add_input(utxo(1, 1300, &script)).unwrap();

    assert_eq!(payment.state(), PaymentState::Errored);
    assert!(!feed.0.borrow().open);
    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Error(e)) if e.is_service() && !e.is_transport()));
}

#[test]
fn broadcast_before_funding_is_refused() {
    let (mut payment, indexer, _) = build(options().manual());

    assert_eq!(payment.broadcast(), PaymentState::Errored);
    assert!(indexer.0.borrow().broadcasts.is_empty());
    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Error(AppError::InsufficientFunds { .. }))));
}

#[test]
fn sweep_requires_destination() {
    let (mut payment, _, _) = build(options().manual());
    assert!(matches!(payment.sweep(None), Err(AppError::Configuration(_))));
}

#[test]
fn sweep_spends_everything_to_destination() {
    let (mut payment, indexer, _) = build(options().manual());
    let script = payment.keys().locking_script();
    indexer.0.borrow_mut().utxos = vec![utxo(1, 1300, &script), utxo(2, 900, &script)];

    payment.sweep(Some(OTHER_ADDRESS)).unwrap();

    let state = indexer.0.borrow();
    let broadcasts = &state.broadcasts;
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].input.len(), 2);
    assert_eq!(broadcasts[0].output.len(), 1);
    assert!(broadcasts[0].output[0].value.to_sat() < 2200);
    assert_eq!(payment.state(), PaymentState::Unfunded);
    assert!(payment.inputs().is_empty());

    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Payment(_))));
}

#[test]
fn sweep_with_nothing_to_spend_reports_error() {
    let (mut payment, _, _) = build(options().manual());

    payment.sweep(Some(OTHER_ADDRESS)).unwrap();
    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Error(AppError::InsufficientFunds { .. }))));
}

#[test]
fn foreign_script_input_cannot_be_signed() {
    let (mut payment, indexer, _) = build(options());
    payment.add_input(utxo(1, 1300, &foreign_script())).unwrap();

    assert_eq!(payment.state(), PaymentState::Errored);
    assert!(indexer.0.borrow().broadcasts.is_empty());
    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Error(AppError::UnsignableInput { input_index: 0, .. }))));
}

#[test]
fn invoice_is_created_and_embedded() {
    let requests = Rc::new(RefCell::new(Vec::new()));
    let invoices = Box::new(FakeInvoices { requests: requests.clone() });
    let mut options = options().manual();
    options.description = Some("coffee".into());
    let mut payment = ProxyPayment::create(
        options,
        Box::new(FakeIndexer::default()),
        Box::new(FakeFeed::default()),
        invoices,
    )
    .unwrap();

    let request = requests.borrow()[0].clone();
    assert_eq!(request.satoshis, 547);
    assert_eq!(request.script, payment.keys().locking_script().to_hex_string());
    assert_eq!(request.description.as_deref(), Some("coffee"));
    assert_eq!(payment.invoice().and_then(|i| i.id.as_deref()), Some("inv-1"));

    let messages = payment.mount(Embed::new("#checkout", DEFAULT_FRAME_ORIGIN).unwrap()).unwrap();
    assert_eq!(messages[0].event, "handshake");
    assert_eq!(
        payment.handle_frame_message(DEFAULT_FRAME_ORIGIN, r#"{"event":"resize","payload":{"height":320}}"#),
        Some(FrameUpdate::Resized { height_px: 320 })
    );
    assert!(payment.frame().unwrap().to_html().contains("height: 320px;"));

    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Invoice(_))));
}

#[test]
fn failed_invoice_load_is_reported() {
    let requests = Rc::new(RefCell::new(Vec::new()));
    let mut payment = ProxyPayment::load(
        "missing",
        options().manual(),
        Box::new(FakeIndexer::default()),
        Box::new(FakeFeed::default()),
        Box::new(FakeInvoices { requests }),
    )
    .unwrap();

    assert!(payment.invoice().is_none());
    assert!(payment.mount(Embed::new("#checkout", DEFAULT_FRAME_ORIGIN).unwrap()).is_err());
    let events = drain(&mut payment);
    assert!(matches!(events.last(), Some(PaymentEvent::Error(AppError::Service { status: 404, .. }))));
}
